use tracing::{info, instrument, warn};

use switchboard_core::{Session, SessionId};
use switchboard_store::StoreError;

use super::{BulkSummary, SessionPage, SessionService, SessionStatusReport};
use crate::error::RuntimeError;

/// Row limit used when walking every session.
const SWEEP_PAGE: u32 = 500;

impl SessionService {
    #[instrument(skip(self, proxy_url))]
    pub fn create(&self, name: &str, proxy_url: Option<&str>) -> Result<Session, RuntimeError> {
        let mut session = Session::new(name)?;
        session.set_proxy_url(proxy_url)?;

        if self.repo.exists_by_name(&session.name)? {
            return Err(RuntimeError::NameTaken(session.name));
        }
        match self.repo.create(&session) {
            Ok(()) => {}
            // Lost a race with a concurrent create of the same name.
            Err(StoreError::Conflict(_)) => return Err(RuntimeError::NameTaken(session.name)),
            Err(e) => return Err(e.into()),
        }
        info!(session_id = %session.id, name = %session.name, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<Session, RuntimeError> {
        self.load(id)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Session, RuntimeError> {
        Ok(self.repo.get_by_name(name.trim())?)
    }

    pub fn list(&self, limit: u32, offset: u32) -> Result<SessionPage, RuntimeError> {
        Ok(SessionPage {
            sessions: self.repo.list(limit, offset)?,
            total: self.repo.count()?,
        })
    }

    /// Remove the live client (close errors logged) and then the record.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete(&self, id: &SessionId) -> Result<(), RuntimeError> {
        if !self.repo.exists(id)? {
            return Err(RuntimeError::SessionNotFound(id.clone()));
        }
        self.registry.remove_client(id).await;
        self.repo.delete(id).map_err(|e| RuntimeError::lookup(id, e))?;
        info!("session deleted");
        Ok(())
    }

    /// Delete every session. Individual failures are collected, not raised.
    pub async fn delete_all(&self) -> Result<BulkSummary, RuntimeError> {
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.repo.list(SWEEP_PAGE, offset)?;
            let fetched = page.len() as u32;
            ids.extend(page.into_iter().map(|s| s.id));
            if fetched < SWEEP_PAGE {
                break;
            }
            offset += fetched;
        }

        let mut summary = BulkSummary {
            total: ids.len(),
            ..BulkSummary::default()
        };
        for id in ids {
            match self.delete(&id).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "delete failed during bulk delete");
                    summary.failed += 1;
                    summary.errors.push((id, e.to_string()));
                }
            }
        }
        info!(total = summary.total, failed = summary.failed, "bulk delete finished");
        Ok(summary)
    }

    /// Takes effect the next time a client is created for the session.
    #[instrument(skip(self, proxy_url), fields(session_id = %id))]
    pub fn set_proxy(&self, id: &SessionId, proxy_url: Option<&str>) -> Result<Session, RuntimeError> {
        let mut session = self.load(id)?;
        session.set_proxy_url(proxy_url)?;
        self.save(&session)?;
        info!(proxy = session.proxy.is_some(), "proxy updated");
        Ok(session)
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionStatusReport, RuntimeError> {
        let session = self.load(id)?;
        Ok(SessionStatusReport {
            client: self.registry.client_health(id),
            session,
        })
    }
}
