//! Configuration loading: compiled-in defaults, overridden by an optional
//! config file, further overridden by environment variables, further
//! overridden by explicit CLI flags (applied by `main.rs` after `load()`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::constants;

/// Runtime configuration for the broker.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Address the frame transport listens on, e.g. `"0.0.0.0:8080"`.
    pub listen_addr: String,
    /// Upstream MUD host.
    pub upstream_host: String,
    /// Upstream MUD port.
    pub upstream_port: u16,
    /// Path to the sound rule document, loaded at startup.
    pub rule_document_path: Option<PathBuf>,
    /// Base path sound asset paths are resolved relative to, as known by
    /// the peer. Not read from disk by the broker; forwarded verbatim.
    pub rule_asset_base: String,
    /// Maximum retained history size, in bytes.
    pub history_bytes_max: usize,
    /// Maximum retained history size, in lines.
    pub history_lines_max: usize,
    /// Maximum depth of a session's pending-command queue.
    pub command_queue_max: usize,
    /// Seconds an unattached session survives before sweep eviction.
    pub idle_timeout_secs: u64,
    /// Seconds between sweep passes.
    pub sweep_interval_secs: u64,
    /// Seconds an upstream write may block before failing.
    pub write_timeout_secs: u64,
    /// Buffered outgoing frames per transport before closing for
    /// back-pressure.
    pub transport_write_highwater: usize,
    /// Sustained frames/second allowed per transport.
    pub rate_limit_frames_per_sec: u32,
    /// Maximum size of a single frame on the wire, in bytes.
    pub max_frame_bytes: usize,
    /// Enables `/sessions`, `/api/sessions/status`, `/logs`,
    /// `/api/logs/stream` inspection endpoints. Forbidden in production;
    /// also settable via the `DEBUG` environment variable.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            upstream_host: "localhost".to_string(),
            upstream_port: 4000,
            rule_document_path: None,
            rule_asset_base: "/sounds".to_string(),
            history_bytes_max: constants::HISTORY_BYTES_MAX,
            history_lines_max: constants::HISTORY_LINES_MAX,
            command_queue_max: constants::COMMAND_QUEUE_MAX,
            idle_timeout_secs: constants::IDLE_TIMEOUT.as_secs(),
            sweep_interval_secs: constants::SWEEP_INTERVAL.as_secs(),
            write_timeout_secs: constants::WRITE_TIMEOUT.as_secs(),
            transport_write_highwater: constants::TRANSPORT_WRITE_HIGHWATER,
            rate_limit_frames_per_sec: constants::RATE_LIMIT_FRAMES_PER_SEC,
            max_frame_bytes: constants::MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration: start from defaults, overlay an optional
    /// config file, then overlay environment variable overrides.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MUDBROKER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("MUDBROKER_UPSTREAM_HOST") {
            self.upstream_host = v;
        }
        if let Ok(v) = std::env::var("MUDBROKER_UPSTREAM_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.upstream_port = port;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_RULE_DOCUMENT_PATH") {
            self.rule_document_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MUDBROKER_RULE_ASSET_BASE") {
            self.rule_asset_base = v;
        }
        if let Ok(v) = std::env::var("MUDBROKER_HISTORY_BYTES_MAX") {
            if let Ok(n) = v.parse() {
                self.history_bytes_max = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_HISTORY_LINES_MAX") {
            if let Ok(n) = v.parse() {
                self.history_lines_max = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_COMMAND_QUEUE_MAX") {
            if let Ok(n) = v.parse() {
                self.command_queue_max = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_IDLE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.idle_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_SWEEP_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.sweep_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_WRITE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.write_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_TRANSPORT_WRITE_HIGHWATER") {
            if let Ok(n) = v.parse() {
                self.transport_write_highwater = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_RATE_LIMIT_FRAMES_PER_SEC") {
            if let Ok(n) = v.parse() {
                self.rate_limit_frames_per_sec = n;
            }
        }
        if let Ok(v) = std::env::var("MUDBROKER_MAX_FRAME_BYTES") {
            if let Ok(n) = v.parse() {
                self.max_frame_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("DEBUG") {
            self.debug = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    /// Idle timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a [`std::time::Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Write timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.write_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.history_bytes_max, 512 * 1024);
        assert_eq!(config.history_lines_max, 2_000);
        assert_eq!(config.command_queue_max, 10);
        assert_eq!(config.idle_timeout_secs, 600);
        assert_eq!(config.rate_limit_frames_per_sec, 20);
        assert_eq!(config.max_frame_bytes, 64 * 1024);
        assert!(!config.debug);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"listen_addr":"0.0.0.0:9090","upstream_port":5000}"#)
            .expect("write config");
        let config = Config::load_from_file(&path).expect("load config");
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.upstream_port, 5000);
        // Untouched fields keep their serde `default` values.
        assert_eq!(config.history_lines_max, 2_000);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).expect("load config");
        assert_eq!(config.listen_addr, Config::default().listen_addr);
    }
}
