//! Startup sweep that brings previously authenticated sessions back online.
//!
//! Attempts run concurrently behind a fixed number of permits. Each attempt
//! has its own deadline and cancellation scope, so a stuck session only ever
//! costs one permit for at most one deadline. Results land in a pre-sized
//! slot per session.
//!
//! The sweep ends early when either the caller's token or the registry's
//! shutdown token fires. Interrupted attempts leave their stored record as it
//! was, so those sessions stay eligible for the next sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use switchboard_core::{ClientError, ConnectResult, Session, SessionId, SessionStatus};
use switchboard_settings::ReconnectSettings;
use switchboard_store::SessionRepository;

use crate::error::RuntimeError;
use crate::registry::{with_deadline, ClientRegistry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_concurrent: usize,
    pub attempt_timeout: Duration,
    /// Row limit for each of the two eligibility queries.
    pub page_size: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            attempt_timeout: Duration::from_secs(30),
            page_size: 1000,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            max_concurrent: s.max_concurrent.max(1),
            attempt_timeout: Duration::from_millis(s.attempt_timeout_ms),
            page_size: s.page_size.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconnectResult {
    pub session_id: SessionId,
    pub name: String,
    pub success: bool,
    /// Stopped by cancellation or registry shutdown; the record was not written.
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ReconnectResult {
    fn interrupted(session: &Session, error: String) -> Self {
        Self {
            session_id: session.id.clone(),
            name: session.name.clone(),
            success: false,
            cancelled: true,
            error: Some(error),
            duration_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectReport {
    pub total_eligible: usize,
    /// Sessions returned by the queries that were not eligible.
    pub skipped: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Failures that were interrupted rather than attempted to completion.
    pub cancelled_count: usize,
    pub results: Vec<ReconnectResult>,
    pub duration_ms: u64,
}

pub struct AutoReconnector {
    registry: Arc<ClientRegistry>,
    repo: Arc<dyn SessionRepository>,
    config: ReconnectConfig,
}

impl AutoReconnector {
    pub fn new(
        registry: Arc<ClientRegistry>,
        repo: Arc<dyn SessionRepository>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            registry,
            repo,
            config,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Reconnect every eligible session. Only the eligibility queries can fail
    /// the sweep as a whole; per-session failures are reported in the result.
    #[instrument(skip_all, fields(max_concurrent = self.config.max_concurrent))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ReconnectReport, RuntimeError> {
        let started = Instant::now();

        let mut candidates = self
            .repo
            .get_by_status(SessionStatus::Connected, self.config.page_size, 0)?;
        candidates.extend(
            self.repo
                .get_by_status(SessionStatus::Connecting, self.config.page_size, 0)?,
        );

        let fetched = candidates.len();
        let eligible: Vec<Session> = candidates
            .into_iter()
            .filter(Session::is_reconnect_eligible)
            .collect();
        let skipped = fetched - eligible.len();
        info!(eligible = eligible.len(), skipped, "auto-reconnect sweep starting");

        let sweep = cancel.child_token();
        // Cancelled on return, which also ends the shutdown watcher.
        let _sweep_done = sweep.clone().drop_guard();
        tokio::spawn(cancel_on_shutdown(self.registry.shutdown_token(), sweep.clone()));

        let mut slots: Vec<Option<ReconnectResult>> = vec![None; eligible.len()];
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, session) in eligible.iter().cloned().enumerate() {
            let attempt = Attempt {
                registry: self.registry.clone(),
                repo: self.repo.clone(),
                deadline: self.config.attempt_timeout,
            };
            let permits = permits.clone();
            let sweep = sweep.clone();
            tasks.spawn(async move {
                let result = attempt.run(session, permits, sweep).await;
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "reconnect task aborted"),
            }
        }

        let results: Vec<ReconnectResult> = slots
            .into_iter()
            .zip(&eligible)
            .map(|(slot, session)| {
                slot.unwrap_or_else(|| {
                    ReconnectResult::interrupted(session, "reconnect task aborted".into())
                })
            })
            .collect();

        let success_count = results.iter().filter(|r| r.success).count();
        let report = ReconnectReport {
            total_eligible: eligible.len(),
            skipped,
            success_count,
            failure_count: results.len() - success_count,
            cancelled_count: results.iter().filter(|r| r.cancelled).count(),
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            eligible = report.total_eligible,
            succeeded = report.success_count,
            failed = report.failure_count,
            cancelled = report.cancelled_count,
            duration_ms = report.duration_ms,
            "auto-reconnect sweep finished"
        );
        Ok(report)
    }
}

async fn cancel_on_shutdown(shutdown: CancellationToken, sweep: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {
            if !sweep.is_cancelled() {
                info!("client registry stopping; abandoning reconnect sweep");
                sweep.cancel();
            }
        }
        _ = sweep.cancelled() => {}
    }
}

/// One session's reconnect, owned by its task.
struct Attempt {
    registry: Arc<ClientRegistry>,
    repo: Arc<dyn SessionRepository>,
    deadline: Duration,
}

impl Attempt {
    async fn run(
        self,
        session: Session,
        permits: Arc<Semaphore>,
        sweep: CancellationToken,
    ) -> ReconnectResult {
        let permit = tokio::select! {
            biased;
            _ = sweep.cancelled() => None,
            permit = permits.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return ReconnectResult::interrupted(&session, ClientError::Cancelled.to_string());
        };

        let started = Instant::now();
        // Child scope: the attempt deadline cancels it without touching the sweep.
        let scope = sweep.child_token();
        let outcome = self.connect(&session.id, &scope).await;

        let (error, cancelled) = match outcome {
            Ok(result) => {
                self.record_success(&session, &result);
                (None, false)
            }
            Err(e) if sweep.is_cancelled() || matches!(e, RuntimeError::NotRunning) => {
                info!(session_id = %session.id, error = %e, "reconnect interrupted; record left as is");
                (Some(e.to_string()), true)
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, error_kind = e.error_kind(), "reconnect failed");
                self.record_failure(&session);
                (Some(e.to_string()), false)
            }
        };

        ReconnectResult {
            session_id: session.id,
            name: session.name,
            success: error.is_none(),
            cancelled,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn connect(
        &self,
        id: &SessionId,
        scope: &CancellationToken,
    ) -> Result<ConnectResult, RuntimeError> {
        let client = self.registry.create_client(id)?;
        let result = with_deadline(self.deadline, scope, client.connect(scope))
            .await
            .map_err(|e| RuntimeError::client(id, e))?;
        if !result.status.is_established() {
            return Err(RuntimeError::client(
                id,
                ClientError::ConnectionFailed(format!("engine reported {}", result.status)),
            ));
        }
        Ok(result)
    }

    /// Reconcile the stored record with the live connection. The record is
    /// re-read so a concurrent callback write is not clobbered by the
    /// snapshot taken before the attempt.
    fn record_success(&self, snapshot: &Session, result: &ConnectResult) {
        let mut session = self.repo.get_by_id(&snapshot.id).unwrap_or_else(|_| snapshot.clone());
        let external_id = if result.external_id.is_empty() {
            session.external_id.clone()
        } else {
            result.external_id.clone()
        };

        let changed = if session.status != SessionStatus::Connected {
            session.connect(&external_id).is_ok()
        } else if session.external_id != external_id {
            session.update_external_id(&external_id).is_ok()
        } else {
            false
        };

        if changed {
            if let Err(e) = self.repo.update(&session) {
                warn!(session_id = %session.id, error = %e, "failed to persist reconnected session");
            }
        }
        debug!(session_id = %session.id, changed, "session reconnected");
    }

    fn record_failure(&self, snapshot: &Session) {
        let mut session = self.repo.get_by_id(&snapshot.id).unwrap_or_else(|_| snapshot.clone());
        session.disconnect();
        if let Err(e) = self.repo.update(&session) {
            warn!(session_id = %session.id, error = %e, "failed to persist reconnect failure");
        }
    }
}
