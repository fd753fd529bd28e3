//! Session Manager: owns the `public_id -> Session` mapping and enforces
//! identity.
//!
//! The manager's mutex guards only the map itself; it is never held while
//! session-internal work runs, so a slow session never blocks `attach`,
//! `detach`, or `sweep` for unrelated sessions.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::id::{Owner, PublicId};
use crate::session::{Session, TransportHandle, TransportId};
use crate::sound::SoundEngine;

/// Outcome of a successful `attach`.
#[derive(Debug)]
pub struct AttachOutcome {
    pub session: Arc<Session>,
    pub public_id: PublicId,
    pub owner: Owner,
    pub status: AttachStatus,
    pub has_history: bool,
}

/// Whether `attach` created a brand-new session or recovered an existing
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Created,
    Recovered,
}

impl AttachStatus {
    #[must_use]
    pub fn as_wire_str(self) -> &'static str {
        match self {
            AttachStatus::Created => "created",
            AttachStatus::Recovered => "recovered",
        }
    }
}

/// Owns the process-wide `public_id -> Session` mapping.
pub struct SessionManager {
    sessions: Mutex<HashMap<PublicId, Arc<Session>>>,
    config: Arc<Config>,
    sound_engine: Arc<SoundEngine>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<Config>, sound_engine: Arc<SoundEngine>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            sound_engine,
        })
    }

    /// `attach`: create-or-recover a session and bind a transport to it.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::OwnerMismatch` if `public_id` is known and
    /// `owner` does not match, or `BrokerError::UnknownSessionWithOwner`
    /// if `owner` was presented for a `public_id` the manager has never
    /// registered (neither case mutates any session).
    pub async fn attach(
        &self,
        transport_id: TransportId,
        handle: TransportHandle,
        requested_public_id: Option<&str>,
        requested_owner: Option<&str>,
    ) -> Result<AttachOutcome, BrokerError> {
        let requested_public_id = requested_public_id
            .map(PublicId::parse)
            .transpose()
            .map_err(|_| BrokerError::MalformedFrame("invalid publicId".to_string()))?;
        let requested_owner = requested_owner
            .map(Owner::parse)
            .transpose()
            .map_err(|_| BrokerError::MalformedFrame("invalid owner".to_string()))?;

        let existing = match requested_public_id {
            Some(id) => {
                let sessions = self.sessions.lock().await;
                sessions.get(&id).cloned()
            }
            None => None,
        };

        match (requested_public_id, existing) {
            (Some(_), Some(session)) => {
                let Some(presented) = requested_owner else {
                    return Err(BrokerError::OwnerMismatch);
                };
                if presented != session.owner {
                    return Err(BrokerError::OwnerMismatch);
                }
                let (has_history, _state) = session.attach_transport(transport_id, handle).await;
                session.send_recovery_frames(transport_id).await;
                info!("session {} recovered on transport {transport_id}", session.public_id);
                Ok(AttachOutcome {
                    public_id: session.public_id,
                    owner: session.owner,
                    status: AttachStatus::Recovered,
                    has_history,
                    session,
                })
            }
            (Some(_), None) => {
                if requested_owner.is_some() {
                    Err(BrokerError::UnknownSessionWithOwner)
                } else {
                    self.create_and_attach(transport_id, handle).await
                }
            }
            (None, _) => self.create_and_attach(transport_id, handle).await,
        }
    }

    async fn create_and_attach(
        &self,
        transport_id: TransportId,
        handle: TransportHandle,
    ) -> Result<AttachOutcome, BrokerError> {
        let public_id = PublicId::generate();
        let owner = Owner::generate();
        let session = Session::new(public_id, owner, Arc::clone(&self.config), Arc::clone(&self.sound_engine));
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(public_id, Arc::clone(&session));
        }
        let (has_history, _state) = session.attach_transport(transport_id, handle).await;
        info!("session {public_id} created on transport {transport_id}");
        Ok(AttachOutcome {
            session,
            public_id,
            owner,
            status: AttachStatus::Created,
            has_history,
        })
    }

    /// `detach`: remove a transport from a session. Never blocks
    /// upstream progress; does not evict the session by itself.
    pub async fn detach(&self, session: &Arc<Session>, transport_id: TransportId) {
        session.detach_transport(transport_id).await;
    }

    /// Look up a session by `public_id` without any ownership check, for
    /// diagnostics and tests.
    pub async fn get(&self, public_id: PublicId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&public_id).cloned()
    }

    /// `sweep`: evict sessions with no attached transports that have been
    /// idle past `idle_timeout`. Runs on `SWEEP_INTERVAL` from `main`.
    pub async fn sweep(&self) {
        let idle_timeout = self.config.idle_timeout();
        let candidates: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().await;
            sessions.values().cloned().collect()
        };

        let mut evicted = Vec::new();
        for session in candidates {
            if session.is_unattached().await && session.idle_for().await > idle_timeout {
                evicted.push(session.public_id);
            }
        }

        if evicted.is_empty() {
            return;
        }

        let mut sessions = self.sessions.lock().await;
        for public_id in evicted {
            // Acquiring the session's own lock inside `shutdown()` before
            // removing it from the map cancels any `attach` already in
            // flight for this id: the attacher either sees the old
            // session and its closed upstream, or loses the race and the
            // next lookup finds nothing, which is handled as brand new.
            if let Some(session) = sessions.remove(&public_id) {
                session.shutdown().await;
                info!("session {public_id} evicted by sweep (idle)");
            }
        }
    }

    /// Number of live sessions, for diagnostics.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Build the `init_ok` envelope for a successful attach.
#[must_use]
pub fn init_ok_envelope(outcome: &AttachOutcome) -> Envelope {
    Envelope::new(
        crate::envelope::frame::INIT_OK,
        serde_json::json!({
            "publicId": outcome.public_id.to_string(),
            "owner": outcome.owner.to_string(),
            "status": outcome.status.as_wire_str(),
            "hasHistory": outcome.has_history,
        }),
    )
}

/// Build the `session_invalid` envelope for a rejected attach.
#[must_use]
pub fn session_invalid_envelope(err: &BrokerError) -> Envelope {
    Envelope::new(
        crate::envelope::frame::SESSION_INVALID,
        serde_json::json!({
            "reason": err.category(),
            "message": err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::next_transport_id;
    use tokio::sync::mpsc;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Arc::new(Config::default()), Arc::new(SoundEngine::parse("[]")))
    }

    fn handle() -> (TransportHandle, mpsc::Receiver<crate::session::Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (TransportHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_attach_without_public_id_creates_session() {
        let mgr = manager();
        let (h, _rx) = handle();
        let outcome = mgr.attach(next_transport_id(), h, None, None).await.expect("attach");
        assert_eq!(outcome.status, AttachStatus::Created);
        assert!(!outcome.has_history);
        assert_eq!(mgr.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_attach_with_matching_owner_recovers() {
        let mgr = manager();
        let (h1, _rx1) = handle();
        let created = mgr.attach(next_transport_id(), h1, None, None).await.expect("attach");

        let (h2, _rx2) = handle();
        let recovered = mgr
            .attach(
                next_transport_id(),
                h2,
                Some(&created.public_id.to_string()),
                Some(&created.owner.to_string()),
            )
            .await
            .expect("attach");
        assert_eq!(recovered.status, AttachStatus::Recovered);
        assert_eq!(recovered.public_id, created.public_id);
    }

    #[tokio::test]
    async fn test_attach_with_wrong_owner_is_rejected() {
        let mgr = manager();
        let (h1, _rx1) = handle();
        let created = mgr.attach(next_transport_id(), h1, None, None).await.expect("attach");

        let (h2, _rx2) = handle();
        let err = mgr
            .attach(next_transport_id(), h2, Some(&created.public_id.to_string()), Some("not-a-real-owner"))
            .await;
        // A syntactically invalid owner is reported as malformed before
        // any session lookup; well-formed-but-wrong is OwnerMismatch.
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_attach_well_formed_wrong_owner_is_owner_mismatch() {
        let mgr = manager();
        let (h1, _rx1) = handle();
        let created = mgr.attach(next_transport_id(), h1, None, None).await.expect("attach");
        let wrong_owner = Owner::generate().to_string();

        let (h2, _rx2) = handle();
        let err = mgr
            .attach(next_transport_id(), h2, Some(&created.public_id.to_string()), Some(&wrong_owner))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::OwnerMismatch);
    }

    #[tokio::test]
    async fn test_attach_unknown_public_id_with_owner_is_rejected() {
        let mgr = manager();
        let (h, _rx) = handle();
        let bogus_id = PublicId::generate().to_string();
        let owner = Owner::generate().to_string();
        let err = mgr.attach(next_transport_id(), h, Some(&bogus_id), Some(&owner)).await.unwrap_err();
        assert_eq!(err, BrokerError::UnknownSessionWithOwner);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_unattached_sessions() {
        let mut config = Config::default();
        config.idle_timeout_secs = 0;
        let mgr = SessionManager::new(Arc::new(config), Arc::new(SoundEngine::parse("[]")));
        let (h, _rx) = handle();
        let outcome = mgr.attach(next_transport_id(), h, None, None).await.expect("attach");
        mgr.detach(&outcome.session, 1).await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.sweep().await;
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_does_not_evict_attached_sessions() {
        let mgr = manager();
        let (h, _rx) = handle();
        mgr.attach(next_transport_id(), h, None, None).await.expect("attach");
        mgr.sweep().await;
        assert_eq!(mgr.session_count().await, 1);
    }
}
