//! Session id → live engine client map.
//!
//! Lock discipline: the map is guarded by a `parking_lot::RwLock` that is only
//! ever held for in-memory work. Anything that talks to the engine (connect,
//! disconnect, close) first copies the client handles out and releases the
//! lock. Client construction is synchronous and I/O free, so it happens under
//! the write lock to keep `create_client` idempotent.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use switchboard_core::{
    ClientError, ClientFactory, ClientParams, ConnectResult, ConnectionClient, EventHandler,
    SessionId,
};
use switchboard_settings::RegistrySettings;
use switchboard_store::SessionRepository;

use crate::error::RuntimeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Engine calls in flight during a fan-out.
    pub max_concurrent: usize,
    /// Deadline for each engine call the registry makes.
    pub operation_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RegistrySettings> for RegistryConfig {
    fn from(s: &RegistrySettings) -> Self {
        Self {
            max_concurrent: s.max_concurrent.max(1),
            operation_timeout: Duration::from_millis(s.operation_timeout_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClientHealth {
    pub connected: bool,
    pub authenticated: bool,
}

impl ClientHealth {
    fn of(client: &dyn ConnectionClient) -> Self {
        Self {
            connected: client.is_connected(),
            authenticated: client.is_authenticated(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub running: bool,
    pub total_clients: usize,
    pub connected: usize,
    pub authenticated: usize,
    pub uptime_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<(SessionId, String)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub closed: usize,
    pub errors: Vec<(SessionId, String)>,
}

#[derive(Clone, Copy, Debug)]
enum FanOutOp {
    Connect,
    Disconnect,
    Restart,
}

impl FanOutOp {
    fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Restart => "restart",
        }
    }
}

/// Run one engine call under a deadline. On expiry the call's token is
/// cancelled so engine-side work stops too.
pub(crate) async fn with_deadline<T, F>(
    deadline: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(ClientError::Timeout(deadline))
        }
    }
}

/// Owns every live engine client. Construct once and share via `Arc`.
pub struct ClientRegistry {
    factory: Arc<dyn ClientFactory>,
    repo: Arc<dyn SessionRepository>,
    clients: RwLock<HashMap<SessionId, Arc<dyn ConnectionClient>>>,
    global_handler: RwLock<Option<Arc<dyn EventHandler>>>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    lifecycle: RwLock<CancellationToken>,
    config: RegistryConfig,
}

impl ClientRegistry {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        repo: Arc<dyn SessionRepository>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            factory,
            repo,
            clients: RwLock::new(HashMap::new()),
            global_handler: RwLock::new(None),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            lifecycle: RwLock::new(CancellationToken::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    /// Token cancelled by `stop`; engine calls made on behalf of the registry
    /// run under a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.lifecycle.read().clone()
    }

    // ── lifecycle ─────────────────────────────────────────────────

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("client registry already running");
            return;
        }
        *self.lifecycle.write() = CancellationToken::new();
        *self.started_at.lock() = Some(Instant::now());
        info!(
            max_concurrent = self.config.max_concurrent,
            operation_timeout_ms = self.config.operation_timeout.as_millis() as u64,
            "client registry started"
        );
    }

    /// Cancel outstanding registry work, then close and drop every client.
    /// Individual close failures are collected, never raised.
    pub async fn stop(&self) -> ShutdownSummary {
        self.running.store(false, Ordering::SeqCst);
        self.lifecycle.read().cancel();
        *self.started_at.lock() = None;

        let drained: Vec<(SessionId, Arc<dyn ConnectionClient>)> =
            self.clients.write().drain().collect();

        let mut summary = ShutdownSummary::default();
        for (id, client) in drained {
            client.remove_event_handler();
            let closed = tokio::time::timeout(self.config.operation_timeout, client.close()).await;
            match closed {
                Ok(Ok(())) => summary.closed += 1,
                Ok(Err(e)) => {
                    warn!(session_id = %id, error = %e, error_kind = e.error_kind(), "close failed during shutdown");
                    summary.errors.push((id, e.to_string()));
                }
                Err(_) => {
                    warn!(session_id = %id, "close timed out during shutdown");
                    summary
                        .errors
                        .push((id, ClientError::Timeout(self.config.operation_timeout).to_string()));
                }
            }
        }

        info!(closed = summary.closed, failed = summary.errors.len(), "client registry stopped");
        summary
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn health_check(&self) -> Result<(), RuntimeError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning)
        }
    }

    // ── map operations ────────────────────────────────────────────

    /// Return the tracked client, or build one seeded from the session's
    /// persisted auth state. A failed lookup seeds an unauthenticated client.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn create_client(&self, id: &SessionId) -> Result<Arc<dyn ConnectionClient>, RuntimeError> {
        self.health_check()?;

        if let Some(existing) = self.clients.read().get(id) {
            return Ok(existing.clone());
        }

        let params = match self.repo.get_by_id(id) {
            Ok(session) => ClientParams {
                session_id: id.clone(),
                external_id: session.external_id,
                proxy: session.proxy,
            },
            Err(e) => {
                warn!(error = %e, "could not read session for client seed; using empty auth state");
                ClientParams::unauthenticated(id.clone())
            }
        };

        let mut clients = self.clients.write();
        // `stop` flips `running` before it drains under this lock, so a stop
        // that landed during the lookup is seen here and nothing leaks past it.
        self.health_check()?;
        // Another caller may have won the race while the lock was released.
        if let Some(existing) = clients.get(id) {
            return Ok(existing.clone());
        }

        let client = self
            .factory
            .create(params)
            .map_err(|e| RuntimeError::client(id, e))?;
        if let Some(handler) = self.global_handler.read().clone() {
            client.set_event_handler(handler);
        }
        clients.insert(id.clone(), client.clone());
        debug!(tracked = clients.len(), "client created");
        Ok(client)
    }

    pub fn get_client(&self, id: &SessionId) -> Result<Arc<dyn ConnectionClient>, RuntimeError> {
        self.clients
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ClientNotFound(id.clone()))
    }

    /// Untrack and close a client. Returns whether one was tracked.
    /// Close errors are logged only.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn remove_client(&self, id: &SessionId) -> bool {
        let Some(client) = self.clients.write().remove(id) else {
            return false;
        };
        client.remove_event_handler();
        match tokio::time::timeout(self.config.operation_timeout, client.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, error_kind = e.error_kind(), "close failed, client dropped anyway"),
            Err(_) => warn!("close timed out, client dropped anyway"),
        }
        true
    }

    /// Tracked session ids, sorted.
    pub fn list_clients(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn health_status(&self) -> BTreeMap<SessionId, ClientHealth> {
        self.snapshot()
            .into_iter()
            .map(|(id, client)| (id, ClientHealth::of(client.as_ref())))
            .collect()
    }

    pub fn client_health(&self, id: &SessionId) -> Option<ClientHealth> {
        self.clients
            .read()
            .get(id)
            .map(|client| ClientHealth::of(client.as_ref()))
    }

    pub fn stats(&self) -> RegistryStats {
        let health = self.health_status();
        RegistryStats {
            running: self.is_running(),
            total_clients: health.len(),
            connected: health.values().filter(|h| h.connected).count(),
            authenticated: health.values().filter(|h| h.authenticated).count(),
            uptime_secs: self.started_at.lock().map(|t| t.elapsed().as_secs()),
        }
    }

    // ── event handler ─────────────────────────────────────────────

    /// Install a handler on every current client and on clients created later.
    pub fn set_global_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.global_handler.write() = Some(handler.clone());
        for (_, client) in self.snapshot() {
            client.set_event_handler(handler.clone());
        }
    }

    pub fn remove_global_event_handler(&self) {
        *self.global_handler.write() = None;
        for (_, client) in self.snapshot() {
            client.remove_event_handler();
        }
    }

    // ── fan-out ───────────────────────────────────────────────────

    fn snapshot(&self) -> Vec<(SessionId, Arc<dyn ConnectionClient>)> {
        self.clients
            .read()
            .iter()
            .map(|(id, client)| (id.clone(), client.clone()))
            .collect()
    }

    pub async fn connect_all(&self) -> FanOutReport {
        let targets = self.snapshot();
        self.fan_out(FanOutOp::Connect, targets).await
    }

    pub async fn disconnect_all(&self) -> FanOutReport {
        let targets = self.snapshot();
        self.fan_out(FanOutOp::Disconnect, targets).await
    }

    /// Restart every client that reports itself disconnected.
    pub async fn restart_unhealthy_clients(&self) -> FanOutReport {
        let targets: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(_, client)| !client.is_connected())
            .collect();
        self.fan_out(FanOutOp::Restart, targets).await
    }

    /// Disconnect (best effort) then reconnect one client.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn restart_client(&self, id: &SessionId) -> Result<ConnectResult, RuntimeError> {
        let client = self.get_client(id)?;
        let cancel = self.shutdown_token().child_token();
        restart(client.as_ref(), &cancel, self.config.operation_timeout)
            .await
            .map_err(|e| RuntimeError::client(id, e))
    }

    /// Bounded-concurrency engine calls over a snapshot. The map lock is not
    /// held while any task runs.
    async fn fan_out(
        &self,
        op: FanOutOp,
        targets: Vec<(SessionId, Arc<dyn ConnectionClient>)>,
    ) -> FanOutReport {
        let mut report = FanOutReport {
            attempted: targets.len(),
            ..FanOutReport::default()
        };
        if targets.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let shutdown = self.shutdown_token();
        let deadline = self.config.operation_timeout;
        let mut tasks = JoinSet::new();

        for (id, client) in targets {
            let permits = permits.clone();
            let cancel = shutdown.child_token();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (id, Err(ClientError::Cancelled));
                };
                let result = match op {
                    FanOutOp::Connect => {
                        with_deadline(deadline, &cancel, client.connect(&cancel))
                            .await
                            .map(|_| ())
                    }
                    FanOutOp::Disconnect => {
                        with_deadline(deadline, &cancel, client.disconnect(&cancel)).await
                    }
                    FanOutOp::Restart => restart(client.as_ref(), &cancel, deadline).await.map(|_| ()),
                };
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.succeeded += 1,
                Ok((id, Err(e))) => {
                    warn!(
                        session_id = %id,
                        op = op.name(),
                        error = %e,
                        error_kind = e.error_kind(),
                        "fan-out call failed"
                    );
                    report.failed += 1;
                    report.errors.push((id, e.to_string()));
                }
                Err(e) => {
                    warn!(op = op.name(), error = %e, "fan-out task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            op = op.name(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "fan-out complete"
        );
        report
    }
}

async fn restart(
    client: &dyn ConnectionClient,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<ConnectResult, ClientError> {
    if let Err(e) = with_deadline(deadline, cancel, client.disconnect(cancel)).await {
        debug!(session_id = %client.session_id(), error = %e, "disconnect before restart failed");
    }
    with_deadline(deadline, cancel, client.connect(cancel)).await
}
