use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use switchboard_core::{ConnectionStatus, SessionError, SessionId, SessionStatus};

use super::{ConnectResponse, DisconnectResponse, SessionService};
use crate::error::RuntimeError;
use crate::registry::with_deadline;

impl SessionService {
    /// Bring a session online. The returned message describes where the
    /// pairing flow stands; only engine or store failures are errors.
    #[instrument(skip(self, cancel), fields(session_id = %id))]
    pub async fn connect(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<ConnectResponse, RuntimeError> {
        let mut session = self.load(id)?;
        if session.status == SessionStatus::Connected {
            return Err(SessionError::AlreadyConnected.into());
        }
        if !session.can_connect() {
            return Err(SessionError::InvalidState(session.status.to_string()).into());
        }

        session.set_connecting();
        self.save(&session)?;

        let client = match self.registry.create_client(id) {
            Ok(client) => client,
            Err(e) => return Err(self.rollback(&mut session, e)),
        };

        let call = cancel.child_token();
        let deadline = self.registry.operation_timeout();
        let result = match with_deadline(deadline, &call, client.connect(&call)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, error_kind = e.error_kind(), "engine connect failed");
                return Err(self.rollback(&mut session, RuntimeError::client(id, e)));
            }
        };

        let mut response = ConnectResponse {
            session: session.clone(),
            message: String::new(),
            needs_auth: false,
            qr_code: None,
        };

        match result.status {
            ConnectionStatus::Connected | ConnectionStatus::Authenticated
                if !result.external_id.is_empty() =>
            {
                session.connect(&result.external_id)?;
                if session.has_qr_code() {
                    session.clear_qr_code();
                }
                response.message = "connected and authenticated".into();
            }
            ConnectionStatus::Connected => {
                response.message = "connected, waiting for authentication".into();
            }
            ConnectionStatus::Authenticating => {
                session.set_qr_code(&result.qr_code);
                response.needs_auth = true;
                response.qr_code = Some(result.qr_code.clone());
                response.message = "scan the QR code to authenticate".into();
            }
            ConnectionStatus::Connecting => {
                response.message = "connection in progress".into();
            }
            other => {
                warn!(status = %other, "engine reported a non-connected status");
                session.disconnect();
                response.message = format!("connection failed: engine reported {other}");
            }
        }

        self.save(&session)?;
        info!(status = %session.status, needs_auth = response.needs_auth, "connect finished");
        response.session = session;
        Ok(response)
    }

    /// Take a session offline. Calling it on a session that is already
    /// disconnected performs no I/O.
    #[instrument(skip(self, cancel), fields(session_id = %id))]
    pub async fn disconnect(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<DisconnectResponse, RuntimeError> {
        let mut session = self.load(id)?;
        if session.status == SessionStatus::Disconnected {
            return Ok(DisconnectResponse {
                session,
                message: "already disconnected".into(),
            });
        }

        if let Ok(client) = self.registry.get_client(id) {
            let call = cancel.child_token();
            let deadline = self.registry.operation_timeout();
            if let Err(e) = with_deadline(deadline, &call, client.disconnect(&call)).await {
                warn!(error = %e, error_kind = e.error_kind(), "engine disconnect failed, continuing");
            }
            self.registry.remove_client(id).await;
        }

        session.disconnect();
        if session.has_qr_code() {
            session.clear_qr_code();
        }
        self.save(&session)?;
        info!("session disconnected");
        Ok(DisconnectResponse {
            session,
            message: "disconnected".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use switchboard_core::{ClientError, Session};
    use switchboard_engine::{MockConnect, MockEngine};
    use switchboard_store::{Database, SessionRepo, SessionRepository};

    use super::*;
    use crate::registry::{ClientRegistry, RegistryConfig};

    struct Fixture {
        engine: MockEngine,
        repo: Arc<SessionRepo>,
        service: SessionService,
    }

    fn fixture_with(config: RegistryConfig) -> Fixture {
        let engine = MockEngine::new();
        let repo = Arc::new(SessionRepo::new(Database::in_memory().unwrap()));
        let registry = Arc::new(ClientRegistry::new(Arc::new(engine.clone()), repo.clone(), config));
        registry.start();
        let service = SessionService::new(repo.clone(), registry);
        Fixture { engine, repo, service }
    }

    fn fixture() -> Fixture {
        fixture_with(RegistryConfig::default())
    }

    fn insert(repo: &SessionRepo, name: &str) -> Session {
        let session = Session::new(name).unwrap();
        repo.create(&session).unwrap();
        session
    }

    #[tokio::test]
    async fn authenticated_result_connects_session() {
        let f = fixture();
        let session = insert(&f.repo, "bot-ok");
        f.engine.script(&session.id, vec![MockConnect::authenticated("5511@net")]);

        let resp = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(!resp.needs_auth);
        assert_eq!(resp.session.status, SessionStatus::Connected);
        assert!(resp.session.is_active);
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().external_id, "5511@net");
    }

    #[tokio::test]
    async fn connected_without_external_id_waits() {
        let f = fixture();
        let session = insert(&f.repo, "bot-wait");
        f.engine.script(&session.id, vec![MockConnect::status(ConnectionStatus::Connected)]);

        let resp = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(resp.message.contains("waiting"));
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().status, SessionStatus::Connecting);
    }

    #[tokio::test]
    async fn connecting_result_stays_in_flight() {
        let f = fixture();
        let session = insert(&f.repo, "bot-slow");
        f.engine.script(&session.id, vec![MockConnect::status(ConnectionStatus::Connecting)]);

        let resp = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(resp.message.contains("in progress"));
        assert_eq!(resp.session.status, SessionStatus::Connecting);
    }

    #[tokio::test]
    async fn error_status_disconnects_without_failing() {
        let f = fixture();
        let session = insert(&f.repo, "bot-err");
        f.engine.script(&session.id, vec![MockConnect::status(ConnectionStatus::Error)]);

        let resp = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(resp.message.contains("failed"));
        let stored = f.repo.get_by_id(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn engine_failure_rolls_back() {
        let f = fixture();
        let session = insert(&f.repo, "bot-fail");
        f.engine.script(
            &session.id,
            vec![MockConnect::Fail(ClientError::ConnectionFailed("refused".into()))],
        );

        let err = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.error_kind(), "connection_failed");
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn client_creation_failure_rolls_back() {
        let f = fixture();
        let session = insert(&f.repo, "bot-nocl");
        f.engine.fail_create(&session.id);

        let err = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Client { .. }));
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().status, SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_engine_times_out_and_rolls_back() {
        let f = fixture_with(RegistryConfig {
            max_concurrent: 5,
            operation_timeout: Duration::from_secs(2),
        });
        let session = insert(&f.repo, "bot-hang");
        f.engine.script(&session.id, vec![MockConnect::Hang]);

        let err = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.error_kind(), "timeout");
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn caller_cancellation_rolls_back() {
        let f = fixture();
        let session = insert(&f.repo, "bot-cancel");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.service.connect(&session.id, &cancel).await.unwrap_err();
        assert_eq!(err.error_kind(), "cancelled");
        assert_eq!(f.repo.get_by_id(&session.id).unwrap().status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .connect(&SessionId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_tears_down_client() {
        let f = fixture();
        let session = insert(&f.repo, "bot-down");
        f.engine.script(&session.id, vec![MockConnect::authenticated("5511@net")]);
        f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        let mock = f.engine.client(&session.id).unwrap();

        let resp = f.service.disconnect(&session.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(resp.session.status, SessionStatus::Disconnected);
        assert_eq!(resp.session.external_id, "5511@net");
        assert!(mock.is_closed());
        assert!(f.service.registry().list_clients().is_empty());
    }

    #[tokio::test]
    async fn disconnect_survives_engine_error() {
        let f = fixture();
        let session = insert(&f.repo, "bot-stuck");
        f.engine.script(&session.id, vec![MockConnect::authenticated("5511@net")]);
        f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        f.engine.fail_disconnect(&session.id);

        let resp = f.service.disconnect(&session.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(resp.session.status, SessionStatus::Disconnected);
        assert_eq!(f.engine.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn disconnect_clears_pending_qr() {
        let f = fixture();
        let session = insert(&f.repo, "bot-pair");
        let resp = f.service.connect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(resp.needs_auth);

        let resp = f.service.disconnect(&session.id, &CancellationToken::new()).await.unwrap();
        assert!(resp.session.qr_code.is_empty());
    }
}
