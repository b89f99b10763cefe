//! Persists engine callbacks onto session records.
//!
//! Callbacks never fail toward the engine: every problem is logged and the
//! event is dropped. Each callback is an independent load-modify-store, so a
//! callback racing a foreground use case on the same session resolves as
//! last-write-wins.

use std::sync::Arc;

use tracing::{debug, info, warn};

use switchboard_core::{EventHandler, IncomingMessage, Session, SessionId, SessionStatus};
use switchboard_store::SessionRepository;

pub struct SessionEventHandler {
    repo: Arc<dyn SessionRepository>,
}

impl SessionEventHandler {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo }
    }

    fn load(&self, session_id: &SessionId, event: &'static str) -> Option<Session> {
        match self.repo.get_by_id(session_id) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(session_id = %session_id, event, error = %e, "event for unreadable session dropped");
                None
            }
        }
    }

    fn save(&self, session: &Session, event: &'static str) {
        if let Err(e) = self.repo.update(session) {
            warn!(session_id = %session.id, event, error = %e, "failed to persist session after event");
        }
    }
}

impl EventHandler for SessionEventHandler {
    fn on_connected(&self, session_id: &SessionId, external_id: &str) {
        info!(session_id = %session_id, external_id, "engine connected");
    }

    fn on_disconnected(&self, session_id: &SessionId, reason: &str) {
        info!(session_id = %session_id, reason, "engine disconnected");
        let Some(mut session) = self.load(session_id, "disconnected") else {
            return;
        };
        session.disconnect();
        if session.has_qr_code() {
            session.clear_qr_code();
        }
        self.save(&session, "disconnected");
    }

    fn on_qr_code(&self, session_id: &SessionId, qr_code: &str) {
        debug!(session_id = %session_id, "pairing code received");
        let Some(mut session) = self.load(session_id, "qr_code") else {
            return;
        };
        session.set_qr_code(qr_code);
        self.save(&session, "qr_code");
    }

    fn on_authenticated(&self, session_id: &SessionId, external_id: &str) {
        info!(session_id = %session_id, external_id, "engine authenticated");
        let Some(mut session) = self.load(session_id, "authenticated") else {
            return;
        };
        let applied = if session.status == SessionStatus::Connected {
            session.update_external_id(external_id)
        } else {
            session.connect(external_id)
        };
        if let Err(e) = applied {
            warn!(session_id = %session_id, error = %e, "authentication event rejected");
            return;
        }
        session.clear_qr_code();
        self.save(&session, "authenticated");
    }

    fn on_authentication_failed(&self, session_id: &SessionId, reason: &str) {
        warn!(session_id = %session_id, reason, "engine authentication failed");
    }

    fn on_message(&self, session_id: &SessionId, message: &IncomingMessage) {
        debug!(
            session_id = %session_id,
            message_id = %message.message_id,
            from = %message.from,
            "message received"
        );
    }

    fn on_error(&self, session_id: &SessionId, error: &str) {
        warn!(session_id = %session_id, error, "engine error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_store::{Database, SessionRepo};

    fn setup() -> (Arc<SessionRepo>, SessionEventHandler) {
        let repo = Arc::new(SessionRepo::new(Database::in_memory().unwrap()));
        let handler = SessionEventHandler::new(repo.clone());
        (repo, handler)
    }

    fn connected(repo: &SessionRepo, name: &str) -> Session {
        let mut session = Session::new(name).unwrap();
        session.set_qr_code("QR-stale");
        session.connect("5511@net").unwrap();
        repo.create(&session).unwrap();
        session
    }

    #[test]
    fn disconnected_keeps_identity_and_clears_qr() {
        let (repo, handler) = setup();
        let session = connected(&repo, "bot-1");

        handler.on_disconnected(&session.id, "stream closed");

        let stored = repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert!(!stored.is_active);
        assert_eq!(stored.external_id, "5511@net");
        assert!(stored.qr_code.is_empty());
        assert!(stored.updated_at > session.updated_at);
    }

    #[test]
    fn qr_code_is_persisted() {
        let (repo, handler) = setup();
        let session = Session::new("bot-qr").unwrap();
        repo.create(&session).unwrap();

        handler.on_qr_code(&session.id, "QR-abc");
        assert_eq!(repo.get_by_id(&session.id).unwrap().qr_code, "QR-abc");
    }

    #[test]
    fn authenticated_connects_and_clears_qr() {
        let (repo, handler) = setup();
        let mut session = Session::new("bot-auth").unwrap();
        session.set_connecting();
        session.set_qr_code("QR-pending");
        repo.create(&session).unwrap();

        handler.on_authenticated(&session.id, "5599@net");

        let stored = repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
        assert!(stored.is_active);
        assert_eq!(stored.external_id, "5599@net");
        assert!(!stored.has_qr_code());
    }

    #[test]
    fn authenticated_on_connected_session_updates_id() {
        let (repo, handler) = setup();
        let session = connected(&repo, "bot-2");

        handler.on_authenticated(&session.id, "7777@net");

        let stored = repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
        assert_eq!(stored.external_id, "7777@net");
    }

    #[test]
    fn empty_external_id_is_ignored() {
        let (repo, handler) = setup();
        let session = Session::new("bot-empty").unwrap();
        repo.create(&session).unwrap();

        handler.on_authenticated(&session.id, "");
        let stored = repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert_eq!(stored.updated_at, session.updated_at);
    }

    #[test]
    fn unknown_session_is_tolerated() {
        let (repo, handler) = setup();
        let ghost = SessionId::new();
        handler.on_disconnected(&ghost, "gone");
        handler.on_qr_code(&ghost, "QR");
        handler.on_authenticated(&ghost, "1@net");
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn log_only_callbacks_leave_record_alone() {
        let (repo, handler) = setup();
        let session = connected(&repo, "bot-3");
        let message = IncomingMessage {
            message_id: "m1".into(),
            from: "5500@net".into(),
            body: "hi".into(),
            timestamp: chrono::Utc::now(),
        };

        handler.on_connected(&session.id, "5511@net");
        handler.on_authentication_failed(&session.id, "bad pairing");
        handler.on_message(&session.id, &message);
        handler.on_error(&session.id, "socket reset");

        let stored = repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.updated_at, session.updated_at);
    }
}
