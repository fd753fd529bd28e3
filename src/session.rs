//! The Session: per-user state machine and multiplexer.
//!
//! A `Session` is reached only through [`crate::manager::SessionManager`].
//! All internal mutation goes through a single `tokio::sync::Mutex`, so the
//! ordering guarantees in the concurrency model hold by construction: two
//! transports submitting commands concurrently serialize on this lock,
//! and the upstream-reader task serializes against them the same way.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::constants;
use crate::envelope::{frame, Envelope};
use crate::id::{Owner, PublicId};
use crate::sound::{SoundEngine, SoundOp};
use crate::upstream::{self, UpstreamWriter, WriteOutcome};

/// Session lifecycle state, per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingLogin,
}

impl SessionState {
    /// Wire representation used in `state` frames.
    #[must_use]
    pub fn as_wire_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::AwaitingLogin => "AWAITING_LOGIN",
        }
    }
}

/// Identifies one attached transport connection within a session.
pub type TransportId = u64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh transport id, unique for the lifetime of the process.
#[must_use]
pub fn next_transport_id() -> TransportId {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One frame queued for delivery to a transport's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A ready-to-send, already-encoded frame.
    Frame(String),
    /// A websocket pong reply to a ping, carrying the ping's payload.
    Pong(Vec<u8>),
    /// Close the transport with this code; no further frames follow.
    Close(u16),
}

/// A transport's sending half, held by the session while attached.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    sender: mpsc::Sender<Outbound>,
}

impl TransportHandle {
    #[must_use]
    pub fn new(sender: mpsc::Sender<Outbound>) -> Self {
        Self { sender }
    }
}

struct Inner {
    state: SessionState,
    history: crate::history::History,
    partial_buffer: String,
    pending_commands: VecDeque<String>,
    attached: HashMap<TransportId, TransportHandle>,
    last_activity: Instant,
    credentials_hint: Option<String>,
    upstream_writer: Option<UpstreamWriter>,
    /// Set just before a manual `request_disconnect` or sweep eviction
    /// closes the upstream socket, so the reader task can tell an
    /// intentional close from `UPSTREAM_CLOSED_UNEXPECTEDLY`.
    closing: bool,
    awaiting_login_reply: bool,
}

/// The central per-user entity: identity, history, pending commands, and
/// the set of attached transports.
pub struct Session {
    pub public_id: PublicId,
    pub owner: Owner,
    inner: Mutex<Inner>,
    sound_engine: Arc<SoundEngine>,
    config: Arc<Config>,
}

impl Session {
    /// Construct a fresh, disconnected session.
    #[must_use]
    pub fn new(public_id: PublicId, owner: Owner, config: Arc<Config>, sound_engine: Arc<SoundEngine>) -> Arc<Self> {
        let inner = Inner {
            state: SessionState::Disconnected,
            history: crate::history::History::new(config.history_bytes_max, config.history_lines_max),
            partial_buffer: String::new(),
            pending_commands: VecDeque::new(),
            attached: HashMap::new(),
            last_activity: Instant::now(),
            credentials_hint: None,
            upstream_writer: None,
            closing: false,
            awaiting_login_reply: false,
        };
        Arc::new(Self {
            public_id,
            owner,
            inner: Mutex::new(inner),
            sound_engine,
            config,
        })
    }

    /// Attach a transport. Caller (the manager) has already resolved
    /// created-vs-recovered and owner checks; this only adds the
    /// transport to the fan-out set and reports whether history exists.
    pub async fn attach_transport(&self, id: TransportId, handle: TransportHandle) -> (bool, SessionState) {
        let mut inner = self.inner.lock().await;
        inner.attached.insert(id, handle);
        inner.last_activity = Instant::now();
        (inner.history.has_history(), inner.state)
    }

    /// Send the `history` and `state` frames to exactly one transport,
    /// used right after a recovered attach.
    pub async fn send_recovery_frames(&self, id: TransportId) {
        let inner = self.inner.lock().await;
        let Some(handle) = inner.attached.get(&id) else {
            return;
        };
        let history_frame = Envelope::new(frame::HISTORY, json!({ "content": inner.history.content() }));
        let state_frame = Envelope::new(frame::STATE, json!({ "value": inner.state.as_wire_str() }));
        send_to(handle, history_frame);
        send_to(handle, state_frame);
    }

    /// Detach a transport. Never blocks upstream progress.
    pub async fn detach_transport(&self, id: TransportId) {
        let mut inner = self.inner.lock().await;
        inner.attached.remove(&id);
        inner.last_activity = Instant::now();
    }

    /// Whether no transports are currently attached.
    pub async fn is_unattached(&self) -> bool {
        self.inner.lock().await.attached.is_empty()
    }

    /// Seconds since the last transport or upstream activity.
    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    /// `request_connect`: open the upstream connection and start the
    /// reader task. No-op (logged) if not currently `Disconnected`.
    pub async fn request_connect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Disconnected {
                debug!("request_connect ignored: session {} not disconnected", self.public_id);
                return;
            }
            inner.state = SessionState::Connecting;
            inner.closing = false;
        }
        self.broadcast_state().await;

        let deadline = Duration::from_secs(10);
        match upstream::open(
            &self.config.upstream_host,
            self.config.upstream_port,
            deadline,
            self.config.write_timeout(),
        )
        .await
        {
            Ok((mut reader, writer)) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.upstream_writer = Some(writer);
                    inner.state = SessionState::Connected;
                }
                info!("session {} connected to upstream", self.public_id);
                self.broadcast_state().await;
                self.drain_pending_commands().await;

                let session = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(chunk) = reader.recv().await {
                        session.ingest_bytes(&chunk).await;
                    }
                    session.on_upstream_closed().await;
                });

                // A prompt with no trailing newline (e.g. a bare "Login:")
                // would otherwise sit in `partial_buffer` forever; flush it
                // periodically so AWAITING_LOGIN/confirm detection still
                // fires without upstream ever sending a newline.
                let flush_session = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(constants::PARTIAL_FLUSH_INTERVAL);
                    loop {
                        ticker.tick().await;
                        if !flush_session.tick_partial_flush().await {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                warn!("session {} upstream connect failed: {e}", self.public_id);
                let mut inner = self.inner.lock().await;
                inner.state = SessionState::Disconnected;
                drop(inner);
                self.broadcast_system(&format!("connection failed: {e}")).await;
                self.broadcast_state().await;
            }
        }
    }

    /// `request_disconnect`: gracefully close upstream and reset state.
    pub async fn request_disconnect(&self) {
        let mut writer = {
            let mut inner = self.inner.lock().await;
            inner.closing = true;
            inner.credentials_hint = None;
            inner.pending_commands.clear();
            inner.state = SessionState::Disconnected;
            inner.upstream_writer.take()
        };
        if let Some(w) = writer.as_mut() {
            w.close().await;
        }
        self.broadcast_state().await;
    }

    async fn on_upstream_closed(&self) {
        let mut inner = self.inner.lock().await;
        let intentional = inner.closing;
        inner.upstream_writer = None;
        inner.state = SessionState::Disconnected;
        inner.closing = false;
        drop(inner);
        if !intentional {
            warn!("session {} upstream closed unexpectedly", self.public_id);
            self.broadcast_system("upstream connection closed unexpectedly").await;
        }
        self.broadcast_state().await;
    }

    /// `submit_command`: split on `;`, write each non-empty piece as a
    /// newline-terminated line, queueing instead when not ready.
    pub async fn submit_command(&self, value: &str) {
        let pieces: Vec<&str> = value.split(';').map(str::trim).filter(|s| !s.is_empty()).collect();
        for piece in pieces {
            self.submit_one_line(piece).await;
        }
    }

    /// `submit_login`: like `submit_command`, but records the username
    /// hint and gates the `AWAITING_LOGIN -> CONNECTED` transition.
    pub async fn submit_login(&self, username: &str, password: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.credentials_hint = Some(username.to_string());
            inner.awaiting_login_reply = true;
        }
        self.submit_one_line(username).await;
        self.submit_one_line(password).await;
    }

    async fn submit_one_line(&self, line: &str) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.last_activity = Instant::now();
            match inner.state {
                SessionState::Connected | SessionState::AwaitingLogin => {
                    if let Some(writer) = inner.upstream_writer.as_mut() {
                        let bytes = format!("{line}\n").into_bytes();
                        // Cloning the writer handle out of the lock would
                        // violate exclusive ownership, so the write
                        // happens while still holding `inner`: the
                        // session mutex already serializes this against
                        // every other mutation per the concurrency model.
                        Some(writer.write(&bytes).await)
                    } else {
                        None
                    }
                }
                SessionState::Connecting | SessionState::Disconnected => None,
            }
        };

        match outcome {
            Some(WriteOutcome::Written) => {}
            Some(WriteOutcome::Backpressure) | None => self.enqueue_pending(line).await,
            Some(WriteOutcome::Closed) => {
                self.enqueue_pending(line).await;
                self.on_upstream_closed().await;
            }
        }
    }

    async fn enqueue_pending(&self, line: &str) {
        let overflowed = {
            let mut inner = self.inner.lock().await;
            if inner.pending_commands.len() >= self.config.command_queue_max {
                true
            } else {
                inner.pending_commands.push_back(line.to_string());
                false
            }
        };
        if overflowed {
            self.broadcast_error("queue_full").await;
        }
    }

    /// Drain `pending_commands` to upstream in arrival order, used after
    /// a successful (re)connect, before any newly submitted command.
    async fn drain_pending_commands(&self) {
        let queued: Vec<String> = {
            let mut inner = self.inner.lock().await;
            inner.pending_commands.drain(..).collect()
        };
        for line in queued {
            self.submit_one_line(&line).await;
        }
    }

    /// Upstream ingestion: assemble complete lines from raw bytes,
    /// append to history, run the sound engine, and fan out. A partial
    /// buffer that has grown past `PARTIAL_FLUSH_BYTES` without a newline
    /// is also flushed immediately, same as the periodic ticker in
    /// `request_connect` does on a 200 ms cadence.
    async fn ingest_bytes(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let mut inner = self.inner.lock().await;
        inner.partial_buffer.push_str(&text);
        inner.last_activity = Instant::now();

        let mut parts: Vec<String> = split_lines(&inner.partial_buffer);
        let remainder = parts.pop().unwrap_or_default();
        inner.partial_buffer = remainder;

        let mut to_dispatch: Vec<(String, Vec<SoundOp>, bool)> = Vec::with_capacity(parts.len());
        for raw_line in parts {
            let trimmed = raw_line.trim_end().to_string();
            inner.history.push(trimmed.clone());
            let gag = self.sound_engine.should_gag(&raw_line);
            let events = self.sound_engine.evaluate(&raw_line);
            to_dispatch.push((trimmed, events, gag));
        }

        if inner.partial_buffer.len() > constants::PARTIAL_FLUSH_BYTES {
            if let Some(flushed) = take_partial_if_prompt(&mut inner) {
                let gag = self.sound_engine.should_gag(&flushed);
                to_dispatch.push((flushed, Vec::new(), gag));
            }
        }

        if to_dispatch.is_empty() {
            let transitioned = detect_login_prompt_transition(&mut inner);
            drop(inner);
            if transitioned {
                self.broadcast_state().await;
            }
            return;
        }

        let attached: Vec<TransportHandle> = inner.attached.values().cloned().collect();
        let was_awaiting_login = inner.state == SessionState::AwaitingLogin;
        drop(inner);

        self.dispatch_lines(&attached, was_awaiting_login, &to_dispatch).await;
    }

    /// Called on a 200 ms tick while connected: flush `partial_buffer` as
    /// a synthetic line if it has no newline yet but already looks like a
    /// recognised prompt (e.g. a bare `"Login: "` with nothing following
    /// it). Returns `false` once the session has disconnected, telling
    /// the caller to stop ticking.
    async fn tick_partial_flush(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Disconnected {
            return false;
        }
        let Some(flushed) = take_partial_if_prompt(&mut inner) else {
            return true;
        };
        let gag = self.sound_engine.should_gag(&flushed);
        let attached: Vec<TransportHandle> = inner.attached.values().cloned().collect();
        let was_awaiting_login = inner.state == SessionState::AwaitingLogin;
        drop(inner);

        self.dispatch_lines(&attached, was_awaiting_login, &[(flushed, Vec::new(), gag)]).await;
        true
    }

    /// Fan out already-assembled lines (`line`/`sound`/`confirm` frames,
    /// honoring each line's `gag` flag), then resolve the login/state
    /// transition the batch implies. Shared by `ingest_bytes` and
    /// `tick_partial_flush` so both dispatch paths stay consistent.
    async fn dispatch_lines(
        &self,
        attached: &[TransportHandle],
        was_awaiting_login: bool,
        to_dispatch: &[(String, Vec<SoundOp>, bool)],
    ) {
        for (line, events, gag) in to_dispatch {
            if !*gag {
                fan_out(attached, Envelope::new(frame::LINE, json!({ "content": line })));
            }
            if !events.is_empty() {
                fan_out(attached, Envelope::new(frame::SOUND, json!({ "events": events })));
            }
            if is_confirm_prompt(line) {
                fan_out(attached, Envelope::new(frame::CONFIRM, json!({ "content": line })));
            }
        }

        if was_awaiting_login {
            self.maybe_confirm_login(to_dispatch).await;
        } else {
            let transitioned = {
                let mut inner = self.inner.lock().await;
                detect_login_prompt_transition(&mut inner)
            };
            if transitioned {
                self.broadcast_state().await;
            }
        }
    }

    async fn maybe_confirm_login(&self, dispatched: &[(String, Vec<SoundOp>, bool)]) {
        let became_connected = {
            let mut inner = self.inner.lock().await;
            if inner.awaiting_login_reply && dispatched.iter().any(|(line, _, _)| !is_login_prompt(line)) {
                inner.state = SessionState::Connected;
                inner.awaiting_login_reply = false;
                true
            } else {
                false
            }
        };
        if became_connected {
            self.broadcast_state().await;
            self.drain_pending_commands().await;
        }
    }

    async fn broadcast_state(&self) {
        let (attached, state) = {
            let inner = self.inner.lock().await;
            (inner.attached.values().cloned().collect::<Vec<_>>(), inner.state)
        };
        fan_out(&attached, Envelope::new(frame::STATE, json!({ "value": state.as_wire_str() })));
    }

    async fn broadcast_system(&self, message: &str) {
        let attached = self.inner.lock().await.attached.values().cloned().collect::<Vec<_>>();
        fan_out(&attached, Envelope::new(frame::SYSTEM, json!({ "message": message })));
    }

    async fn broadcast_error(&self, message: &str) {
        let attached = self.inner.lock().await.attached.values().cloned().collect::<Vec<_>>();
        fan_out(&attached, Envelope::new(frame::ERROR, json!({ "message": message })));
    }

    /// Close upstream and drop all transports; used by sweep eviction.
    pub async fn shutdown(&self) {
        let mut writer = {
            let mut inner = self.inner.lock().await;
            inner.closing = true;
            inner.attached.clear();
            inner.upstream_writer.take()
        };
        if let Some(w) = writer.as_mut() {
            w.close().await;
        }
    }
}

/// If connected and the partial buffer now looks like a login prompt,
/// transition to `AwaitingLogin` and report whether it happened (the
/// caller broadcasts `state` only after releasing the session lock).
fn detect_login_prompt_transition(inner: &mut Inner) -> bool {
    if inner.state != SessionState::Connected {
        return false;
    }
    if is_login_prompt(&inner.partial_buffer) {
        inner.state = SessionState::AwaitingLogin;
        true
    } else {
        false
    }
}

/// Split on `\r?\n`. Every element except the last is a complete line;
/// the last (possibly empty) element is the new partial buffer.
fn split_lines(buffer: &str) -> Vec<String> {
    buffer
        .split('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s).to_string())
        .collect()
}

/// Case-insensitive prompt detection per the reconnection contract.
fn is_login_prompt(text: &str) -> bool {
    const PATTERNS: &[&str] = &["[input]", "name:", "login:", "password:", "senha:"];
    let lower = text.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

/// Confirm-prompt detection per the reconnection contract: matches
/// `"are you sure you'd like to do this?"` or `enter "yes" or "no"`,
/// case-insensitive, optionally wrapped in a single pair of brackets.
fn is_confirm_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    let unbracketed = lower
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .map_or(lower.as_str(), str::trim);
    unbracketed == "are you sure you'd like to do this?" || lower.contains("enter \"yes\" or \"no\"")
}

/// The "recognised prompt pattern" §4.3 flushes a stalled partial buffer
/// against: either a login prompt or a confirm prompt.
fn matches_recognized_prompt(text: &str) -> bool {
    is_login_prompt(text) || is_confirm_prompt(text)
}

/// If the partial buffer is non-empty and already looks like a
/// recognised prompt, take it out as a complete synthetic line (clearing
/// the buffer) and record it in history. Otherwise leave it buffered.
fn take_partial_if_prompt(inner: &mut Inner) -> Option<String> {
    if inner.partial_buffer.is_empty() || !matches_recognized_prompt(&inner.partial_buffer) {
        return None;
    }
    let line = std::mem::take(&mut inner.partial_buffer);
    inner.history.push(line.clone());
    Some(line)
}

fn send_to(handle: &TransportHandle, envelope: Envelope) {
    let now_millis = chrono::Utc::now().timestamp_millis();
    let encoded = envelope.encode(now_millis);
    let _ = handle.sender.try_send(Outbound::Frame(encoded));
}

/// Fan out one envelope to every handle, closing (with 1013) and
/// dropping any transport whose outgoing queue is already full.
fn fan_out(attached: &[TransportHandle], envelope: Envelope) {
    let now_millis = chrono::Utc::now().timestamp_millis();
    let encoded = envelope.encode(now_millis);
    for handle in attached {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            handle.sender.try_send(Outbound::Frame(encoded.clone()))
        {
            let _ = handle.sender.try_send(Outbound::Close(crate::error::close_code::RATE_LIMITED));
        }
    }
}
