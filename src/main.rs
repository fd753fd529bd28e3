use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mudbroker::config::Config;
use mudbroker::manager::SessionManager;
use mudbroker::sound::SoundEngine;
use mudbroker::transport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "mudbroker")]
#[command(version = VERSION)]
#[command(about = "Session broker gateway between frame transports and a line-oriented MUD upstream")]
struct Cli {
    /// Path to a JSON config file, overlaying compiled-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default if no subcommand is given).
    Serve,
    /// Load configuration and the sound rule document, print the
    /// resolved config, and exit without binding a listener.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            std::process::exit(2);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            SoundEngine::parse(&load_rule_document(&config)?);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

fn load_rule_document(config: &Config) -> Result<String> {
    match &config.rule_document_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading sound rule document {}", path.display())),
        None => Ok("[]".to_string()),
    }
}

async fn serve(config: Config) -> Result<()> {
    let sound_engine = Arc::new(SoundEngine::parse(&load_rule_document(&config)?));
    log::info!("loaded {} sound rules", sound_engine.rule_count());

    let config = Arc::new(config);
    let manager = SessionManager::new(Arc::clone(&config), sound_engine);

    let sweep_manager = Arc::clone(&manager);
    let sweep_interval = config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_manager.sweep().await;
        }
    });

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let ctrlc_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        ctrlc_shutdown.notify_one();
    })
    .context("installing ctrl-c handler")?;

    tokio::select! {
        result = transport::serve(&config.listen_addr, manager, Arc::clone(&config)) => result,
        () = shutdown.notified() => {
            log::info!("shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rule_document_defaults_to_empty_array_without_path() {
        let config = Config::default();
        assert_eq!(load_rule_document(&config).expect("ok"), "[]");
    }
}
