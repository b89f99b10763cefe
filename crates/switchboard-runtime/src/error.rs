use switchboard_core::{ClientError, SessionError, SessionId};
use switchboard_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no live client for session {0}")]
    ClientNotFound(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session name already taken: {0}")]
    NameTaken(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine error for session {session_id}: {source}")]
    Client {
        session_id: SessionId,
        #[source]
        source: ClientError,
    },

    #[error("client registry is not running")]
    NotRunning,
}

impl RuntimeError {
    pub fn client(session_id: &SessionId, source: ClientError) -> Self {
        Self::Client {
            session_id: session_id.clone(),
            source,
        }
    }

    /// Map a repository lookup failure, turning `NotFound` into `SessionNotFound`.
    pub fn lookup(session_id: &SessionId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::SessionNotFound(session_id.clone()),
            other => Self::Store(other),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::ClientNotFound(_) => "client_not_found",
            Self::Session(SessionError::AlreadyConnected) => "already_connected",
            Self::Session(SessionError::InvalidState(_)) => "invalid_state",
            Self::Session(_) => "validation",
            Self::NameTaken(_) => "name_taken",
            Self::Store(_) => "store",
            Self::Client { source, .. } => source.error_kind(),
            Self::NotRunning => "not_running",
        }
    }
}
