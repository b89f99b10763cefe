use std::time::Duration;

/// Rejected session transitions and validation failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is already connected")]
    AlreadyConnected,
    #[error("external id must not be empty")]
    InvalidExternalId,
    #[error("invalid session state: {0}")]
    InvalidState(String),
    #[error("invalid session name: {0}")]
    InvalidName(String),
    #[error("invalid proxy url: {0}")]
    InvalidProxy(String),
    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(String),
}

/// Errors surfaced by a protocol engine connection.
/// Opaque to the core beyond this classification.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("pairing failed: {0}")]
    PairingFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("client closed")]
    Closed,
    #[error("engine error: {0}")]
    Engine(String),
}

impl ClientError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::NotConnected => "not_connected",
            Self::NotAuthenticated => "not_authenticated",
            Self::PairingFailed(_) => "pairing_failed",
            Self::SendFailed(_) => "send_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
            Self::Engine(_) => "engine",
        }
    }

    /// Whether the failure came from the caller giving up rather than the engine.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Cancelled)
    }
}
