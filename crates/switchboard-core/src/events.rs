use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub from: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for asynchronous engine callbacks.
///
/// Engines may invoke these from any task and from many connections at once.
/// Implementations must not block for long: the engine's dispatch loop is
/// waiting on them.
pub trait EventHandler: Send + Sync {
    fn on_connected(&self, session_id: &SessionId, external_id: &str);

    fn on_disconnected(&self, session_id: &SessionId, reason: &str);

    fn on_qr_code(&self, session_id: &SessionId, qr_code: &str);

    fn on_authenticated(&self, session_id: &SessionId, external_id: &str);

    fn on_authentication_failed(&self, session_id: &SessionId, reason: &str);

    fn on_message(&self, session_id: &SessionId, message: &IncomingMessage);

    fn on_error(&self, session_id: &SessionId, error: &str);
}
