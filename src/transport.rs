//! Transport Envelope's wire side: the accept loop and per-connection
//! read/write tasks.
//!
//! Each accepted connection gets a reader task (this function body) and a
//! writer task ([`run_writer`]) connected by a bounded channel whose
//! capacity *is* `TRANSPORT_WRITE_HIGHWATER` — a full channel is the
//! back-pressure signal the component design calls for, not a side
//! counter to keep in sync.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error;
use crate::id::PublicId;
use crate::manager::{init_ok_envelope, session_invalid_envelope, SessionManager};
use crate::rate_limit::SlidingWindowLimiter;
use crate::session::{self, Outbound, Session, TransportHandle, TransportId};

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Bind `listen_addr` and accept connections until the process shuts
/// down. Each connection runs its own reader/writer task pair.
pub async fn serve(listen_addr: &str, manager: Arc<SessionManager>, config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding listen address {listen_addr}"))?;
    info!("mudbroker listening on {listen_addr}");

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accepting connection")?;
        let manager = Arc::clone(&manager);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, manager, config).await {
                debug!("connection from {peer_addr} ended: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, manager: Arc<SessionManager>, config: Arc<Config>) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (sink, mut reader) = ws_stream.split();

    let transport_id = session::next_transport_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.transport_write_highwater);
    tokio::spawn(run_writer(outbound_rx, sink));

    let handle = TransportHandle::new(outbound_tx.clone());
    let mut limiter = SlidingWindowLimiter::new(config.rate_limit_frames_per_sec, crate::constants::RATE_LIMIT_WINDOW);
    let mut attached: Option<(PublicId, Arc<Session>)> = None;

    loop {
        let Some(msg) = reader.next().await else {
            break;
        };
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("transport {transport_id} read error: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if limiter.record(Instant::now()) {
                    warn!("transport {transport_id} rate limited");
                    send_close(&outbound_tx, error::close_code::RATE_LIMITED).await;
                    break;
                }
                match Envelope::parse(&text, config.max_frame_bytes) {
                    Ok(envelope) => {
                        if dispatch(
                            envelope,
                            transport_id,
                            &handle,
                            &manager,
                            &outbound_tx,
                            &mut attached,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("transport {transport_id} malformed frame: {err}");
                        if let Some(code) = err.close_code() {
                            send_close(&outbound_tx, code).await;
                            break;
                        }
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = outbound_tx.send(Outbound::Pong(payload.to_vec())).await;
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    if let Some((_public_id, session)) = attached {
        manager.detach(&session, transport_id).await;
    }
    Ok(())
}

/// Handle one decoded frame. Returns `true` if the connection should be
/// closed (the caller has already queued a close frame).
async fn dispatch(
    envelope: Envelope,
    transport_id: TransportId,
    handle: &TransportHandle,
    manager: &Arc<SessionManager>,
    outbound_tx: &mpsc::Sender<Outbound>,
    attached: &mut Option<(PublicId, Arc<Session>)>,
) -> bool {
    match envelope.frame_type.as_str() {
        "init" => {
            // A second `init` on the same transport is destructive: drop
            // the prior attachment before establishing the new one.
            if let Some((_, prev)) = attached.take() {
                manager.detach(&prev, transport_id).await;
            }

            let public_id = envelope.payload_str("publicId");
            let owner = envelope.payload_str("owner");
            match manager.attach(transport_id, handle.clone(), public_id, owner).await {
                Ok(outcome) => {
                    let new_public_id = outcome.public_id;
                    let new_session = Arc::clone(&outcome.session);
                    send_frame(outbound_tx, init_ok_envelope(&outcome)).await;
                    *attached = Some((new_public_id, new_session));
                    false
                }
                Err(err) => {
                    send_frame(outbound_tx, session_invalid_envelope(&err)).await;
                    if let Some(code) = err.close_code() {
                        send_close(outbound_tx, code).await;
                        return true;
                    }
                    false
                }
            }
        }
        "connect" => {
            if let Some((_, session)) = attached.as_ref() {
                let session = Arc::clone(session);
                tokio::spawn(async move { session.request_connect().await });
            }
            false
        }
        "disconnect" => {
            if let Some((_, session)) = attached.as_ref() {
                session.request_disconnect().await;
            }
            false
        }
        "command" => {
            if let Some((_, session)) = attached.as_ref() {
                if let Some(value) = envelope.payload_str("value") {
                    // Awaited inline, not spawned: two `command` frames on
                    // the same transport must apply to the session in the
                    // order they were sent (SPEC_FULL.md Testable Property
                    // #3), which a spawn would not guarantee.
                    session.submit_command(value).await;
                }
            }
            false
        }
        "login" => {
            if let Some((_, session)) = attached.as_ref() {
                let username = envelope.payload_str("username").unwrap_or_default();
                let password = envelope.payload_str("password").unwrap_or_default();
                session.submit_login(username, password).await;
            }
            false
        }
        other => {
            debug!("transport {transport_id} sent unrecognized frame type {other:?}; ignoring");
            false
        }
    }
}

async fn send_frame(outbound_tx: &mpsc::Sender<Outbound>, envelope: Envelope) {
    let encoded = envelope.encode(chrono::Utc::now().timestamp_millis());
    let _ = outbound_tx.send(Outbound::Frame(encoded)).await;
}

async fn send_close(outbound_tx: &mpsc::Sender<Outbound>, code: u16) {
    let _ = outbound_tx.send(Outbound::Close(code)).await;
}

async fn run_writer(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Frame(text) => sink.send(Message::Text(text)).await,
            Outbound::Pong(payload) => sink.send(Message::Pong(payload.into())).await,
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: String::new().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sound::SoundEngine;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_init_without_public_id_returns_init_ok_created() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let manager = SessionManager::new(Arc::new(Config::default()), Arc::new(SoundEngine::parse("[]")));

        let accept_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let _ = handle_connection(stream, accept_manager, Arc::new(Config::default())).await;
        });

        let (ws, _resp) = connect_async(format!("ws://{addr}")).await.expect("connect");
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(r#"{"type":"init","payload":{}}"#.to_string().into()))
            .await
            .expect("send init");

        let msg = read.next().await.expect("message").expect("ok");
        let Message::Text(text) = msg else { panic!("expected text frame") };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "init_ok");
        assert_eq!(value["payload"]["status"], "created");
    }

    #[tokio::test]
    async fn test_init_with_wrong_owner_closes_with_4003() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let manager = SessionManager::new(Arc::new(Config::default()), Arc::new(SoundEngine::parse("[]")));

        let accept_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.expect("accept");
                let m = Arc::clone(&accept_manager);
                tokio::spawn(handle_connection(stream, m, Arc::new(Config::default())));
            }
        });

        let (ws, _resp) = connect_async(format!("ws://{addr}")).await.expect("connect");
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(r#"{"type":"init","payload":{}}"#.to_string().into()))
            .await
            .expect("send init");
        let _init_ok = read.next().await.expect("message");

        let (ws2, _resp2) = connect_async(format!("ws://{addr}")).await.expect("connect");
        let (mut write2, mut read2) = ws2.split();
        write2
            .send(Message::Text(
                r#"{"type":"init","payload":{"publicId":"00000000-0000-0000-0000-000000000000","owner":"11111111-1111-1111-1111-111111111111"}}"#
                    .to_string()
                    .into(),
            ))
            .await
            .expect("send init");

        let mut saw_invalid = false;
        let mut saw_close = false;
        while let Some(Ok(msg)) = read2.next().await {
            match msg {
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                    if value["type"] == "session_invalid" {
                        saw_invalid = true;
                    }
                }
                Message::Close(frame) => {
                    if let Some(f) = frame {
                        assert_eq!(u16::from(f.code), 4003);
                        saw_close = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_invalid);
        assert!(saw_close);
    }
}
