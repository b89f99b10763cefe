//! Single-session operations invoked by the transport layer.
//!
//! Every operation starts from a fresh repository read. Mutations that happen
//! after a `Connecting` write are rolled back to `Disconnected` on failure so
//! a record is never left parked mid-flight.

mod connect;
mod manage;
mod messaging;

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use switchboard_core::{Session, SessionId};
use switchboard_store::SessionRepository;

use crate::error::RuntimeError;
use crate::registry::{ClientHealth, ClientRegistry};

#[derive(Clone, Debug, Serialize)]
pub struct ConnectResponse {
    pub session: Session,
    pub message: String,
    pub needs_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DisconnectResponse {
    pub session: Session,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<(SessionId, String)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatusReport {
    pub session: Session,
    /// Live client state; `None` when no client is tracked.
    pub client: Option<ClientHealth>,
}

/// Use-case entry point. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct SessionService {
    repo: Arc<dyn SessionRepository>,
    registry: Arc<ClientRegistry>,
}

impl SessionService {
    pub fn new(repo: Arc<dyn SessionRepository>, registry: Arc<ClientRegistry>) -> Self {
        Self { repo, registry }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn repo(&self) -> Arc<dyn SessionRepository> {
        self.repo.clone()
    }

    fn load(&self, id: &SessionId) -> Result<Session, RuntimeError> {
        self.repo
            .get_by_id(id)
            .map_err(|e| RuntimeError::lookup(id, e))
    }

    fn save(&self, session: &Session) -> Result<(), RuntimeError> {
        self.repo.update(session).map_err(|e| RuntimeError::lookup(&session.id, e))
    }

    /// Persist `Disconnected` after a failure, then hand back the original error.
    /// A failed rollback write is logged; the caller's error wins.
    fn rollback(&self, session: &mut Session, cause: RuntimeError) -> RuntimeError {
        session.disconnect();
        if let Err(e) = self.repo.update(session) {
            warn!(session_id = %session.id, error = %e, "rollback to disconnected failed");
        }
        cause
    }
}
