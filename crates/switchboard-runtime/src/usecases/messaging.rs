use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use switchboard_core::{SessionError, SessionId};

use super::SessionService;
use crate::error::RuntimeError;
use crate::registry::with_deadline;

const PHONE_MIN_DIGITS: usize = 7;
const PHONE_MAX_DIGITS: usize = 15;

/// Strip `+`, spaces and dashes, then require 7–15 ASCII digits.
pub(crate) fn normalize_phone(raw: &str) -> Result<String, SessionError> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-'))
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(SessionError::InvalidPhoneNumber(format!("{raw}: only digits allowed")));
    }
    if !(PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len()) {
        return Err(SessionError::InvalidPhoneNumber(format!(
            "{raw}: expected {PHONE_MIN_DIGITS}-{PHONE_MAX_DIGITS} digits"
        )));
    }
    Ok(digits)
}

impl SessionService {
    /// Ask the engine for a fresh pairing code and store it on the session.
    #[instrument(skip(self, cancel), fields(session_id = %id))]
    pub async fn generate_qr(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let mut session = self.load(id)?;
        let client = self.registry.create_client(id)?;

        let call = cancel.child_token();
        let qr = with_deadline(self.registry.operation_timeout(), &call, client.generate_qr(&call))
            .await
            .map_err(|e| RuntimeError::client(id, e))?;

        session.set_qr_code(&qr);
        self.save(&session)?;
        Ok(qr)
    }

    /// Pair by phone number instead of QR.
    #[instrument(skip(self, cancel, phone), fields(session_id = %id))]
    pub async fn pair_phone(
        &self,
        id: &SessionId,
        phone: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let phone = normalize_phone(phone)?;
        self.load(id)?;
        let client = self.registry.create_client(id)?;

        let call = cancel.child_token();
        with_deadline(self.registry.operation_timeout(), &call, client.pair_phone(&call, &phone))
            .await
            .map_err(|e| RuntimeError::client(id, e))?;
        info!("phone pairing requested");
        Ok(())
    }

    /// Best-effort send through the live client; returns the engine's message id.
    #[instrument(skip(self, cancel, text), fields(session_id = %id))]
    pub async fn send_message(
        &self,
        id: &SessionId,
        to: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let session = self.load(id)?;
        if !session.is_connected() {
            return Err(SessionError::InvalidState(format!(
                "cannot send while {}",
                session.status
            ))
            .into());
        }
        let client = self.registry.get_client(id)?;

        let call = cancel.child_token();
        let message_id = with_deadline(
            self.registry.operation_timeout(),
            &call,
            client.send_message(&call, to, text),
        )
        .await
        .map_err(|e| RuntimeError::client(id, e))?;
        info!(message_id = %message_id, "message sent");
        Ok(message_id)
    }
}
