use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::events::EventHandler;
use crate::ids::SessionId;
use crate::proxy::ProxyConfig;

/// Connection state as reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Error,
}

impl ConnectionStatus {
    /// Statuses that count as a successful (re)connect.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of one `connect` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResult {
    pub external_id: String,
    pub qr_code: String,
    pub status: ConnectionStatus,
    pub timestamp: DateTime<Utc>,
}

impl ConnectResult {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            external_id: String::new(),
            qr_code: String::new(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = external_id.into();
        self
    }

    pub fn with_qr_code(mut self, qr_code: impl Into<String>) -> Self {
        self.qr_code = qr_code.into();
        self
    }
}

/// Seed for a new engine connection: the durable auth state of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientParams {
    pub session_id: SessionId,
    /// Empty when the session has never authenticated.
    pub external_id: String,
    pub proxy: Option<ProxyConfig>,
}

impl ClientParams {
    /// Params for a session with no usable persisted state.
    pub fn unauthenticated(session_id: SessionId) -> Self {
        Self {
            session_id,
            external_id: String::new(),
            proxy: None,
        }
    }
}

/// Live handle to one protocol connection.
///
/// Every call that talks to the network takes a cancellation token and must
/// return `ClientError::Cancelled` promptly once it fires. Callers layer their
/// own deadlines on top with `tokio::time::timeout`.
#[async_trait]
pub trait ConnectionClient: Send + Sync {
    fn session_id(&self) -> &SessionId;

    async fn connect(&self, cancel: &CancellationToken) -> Result<ConnectResult, ClientError>;

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), ClientError>;

    fn is_connected(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    async fn generate_qr(&self, cancel: &CancellationToken) -> Result<String, ClientError>;

    async fn pair_phone(&self, cancel: &CancellationToken, phone: &str)
        -> Result<(), ClientError>;

    /// Returns the engine's message id.
    async fn send_message(
        &self,
        cancel: &CancellationToken,
        to: &str,
        text: &str,
    ) -> Result<String, ClientError>;

    fn set_event_handler(&self, handler: Arc<dyn EventHandler>);

    fn remove_event_handler(&self);

    /// Releases engine resources. The client is unusable afterwards.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Constructs engine connections. Construction must not perform network I/O.
pub trait ClientFactory: Send + Sync {
    fn create(&self, params: ClientParams) -> Result<Arc<dyn ConnectionClient>, ClientError>;
}
