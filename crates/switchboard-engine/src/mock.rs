use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use switchboard_core::{
    ClientError, ClientFactory, ClientParams, ConnectResult, ConnectionClient, ConnectionStatus,
    EventHandler, IncomingMessage, SessionId,
};

/// Pre-programmed outcome of one `connect` call.
#[derive(Clone, Debug)]
pub enum MockConnect {
    /// Return this result.
    Respond(ConnectResult),
    /// Fail with this error.
    Fail(ClientError),
    /// Wait a duration (cancellable), then resolve the inner script.
    Delay(Duration, Box<MockConnect>),
    /// Never complete on its own; only cancellation or a caller timeout ends it.
    Hang,
}

impl MockConnect {
    pub fn authenticated(external_id: &str) -> Self {
        Self::Respond(ConnectResult::new(ConnectionStatus::Authenticated).with_external_id(external_id))
    }

    pub fn authenticating(qr_code: &str) -> Self {
        Self::Respond(ConnectResult::new(ConnectionStatus::Authenticating).with_qr_code(qr_code))
    }

    pub fn status(status: ConnectionStatus) -> Self {
        Self::Respond(ConnectResult::new(status))
    }

    pub fn delayed(delay: Duration, inner: MockConnect) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    /// `connect` calls currently in flight.
    pub live_connects: usize,
    /// Highest `live_connects` observed.
    pub peak_connects: usize,
    pub total_connects: usize,
    pub clients_created: usize,
    pub disconnects: usize,
    pub closes: usize,
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<HashMap<SessionId, VecDeque<MockConnect>>>,
    default_script: Mutex<Option<MockConnect>>,
    fail_create: Mutex<HashSet<SessionId>>,
    fail_disconnect: Mutex<HashSet<SessionId>>,
    clients: Mutex<HashMap<SessionId, Weak<MockClient>>>,
    connects_by_session: Mutex<HashMap<SessionId, usize>>,
    sent: Mutex<Vec<(SessionId, String, String)>>,
    paired: Mutex<Vec<(SessionId, String)>>,
    live: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
    created: AtomicUsize,
    disconnects: AtomicUsize,
    closes: AtomicUsize,
    qr_seq: AtomicUsize,
    msg_seq: AtomicUsize,
}

/// Scriptable in-process engine.
///
/// Without a script, a client seeded with an external id authenticates
/// immediately; an unseeded client answers `Authenticating` with a QR payload.
/// Scripts queued with [`MockEngine::script`] are consumed one per `connect`
/// call, then [`MockEngine::set_default`] (if any) applies.
#[derive(Clone, Default)]
pub struct MockEngine {
    shared: Arc<Shared>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue connect outcomes for one session.
    pub fn script(&self, session_id: &SessionId, responses: Vec<MockConnect>) {
        self.shared
            .scripts
            .lock()
            .entry(session_id.clone())
            .or_default()
            .extend(responses);
    }

    /// Outcome for every connect call without a queued script.
    pub fn set_default(&self, response: MockConnect) {
        *self.shared.default_script.lock() = Some(response);
    }

    pub fn fail_create(&self, session_id: &SessionId) {
        self.shared.fail_create.lock().insert(session_id.clone());
    }

    pub fn fail_disconnect(&self, session_id: &SessionId) {
        self.shared.fail_disconnect.lock().insert(session_id.clone());
    }

    /// Most recently created client for a session, while something still holds it.
    pub fn client(&self, session_id: &SessionId) -> Option<Arc<MockClient>> {
        self.shared.clients.lock().get(session_id).and_then(Weak::upgrade)
    }

    pub fn stats(&self) -> MockStats {
        let s = &self.shared;
        MockStats {
            live_connects: s.live.load(Ordering::SeqCst),
            peak_connects: s.peak.load(Ordering::SeqCst),
            total_connects: s.total.load(Ordering::SeqCst),
            clients_created: s.created.load(Ordering::SeqCst),
            disconnects: s.disconnects.load(Ordering::SeqCst),
            closes: s.closes.load(Ordering::SeqCst),
        }
    }

    pub fn connect_count(&self, session_id: &SessionId) -> usize {
        self.shared
            .connects_by_session
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// `(session, to, text)` for every accepted send.
    pub fn sent_messages(&self) -> Vec<(SessionId, String, String)> {
        self.shared.sent.lock().clone()
    }

    pub fn paired_phones(&self) -> Vec<(SessionId, String)> {
        self.shared.paired.lock().clone()
    }
}

impl ClientFactory for MockEngine {
    fn create(&self, params: ClientParams) -> Result<Arc<dyn ConnectionClient>, ClientError> {
        if self.shared.fail_create.lock().contains(&params.session_id) {
            return Err(ClientError::Engine(format!(
                "client construction refused for {}",
                params.session_id
            )));
        }

        let client = Arc::new(MockClient {
            state: Mutex::new(ClientState {
                external_id: params.external_id.clone(),
                ..ClientState::default()
            }),
            params,
            handler: RwLock::new(None),
            shared: self.shared.clone(),
        });
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared
            .clients
            .lock()
            .insert(client.params.session_id.clone(), Arc::downgrade(&client));
        debug!(
            session_id = %client.params.session_id,
            seeded = !client.params.external_id.is_empty(),
            "mock client created"
        );
        Ok(client as Arc<dyn ConnectionClient>)
    }
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    authenticated: bool,
    closed: bool,
    external_id: String,
}

pub struct MockClient {
    params: ClientParams,
    state: Mutex<ClientState>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    shared: Arc<Shared>,
}

/// Decrements the live-connect counter however the connect future ends,
/// including being dropped by a caller timeout.
struct LiveGuard<'a>(&'a Shared);

impl<'a> LiveGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak.fetch_max(now, Ordering::SeqCst);
        shared.total.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockClient {
    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn has_event_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.read().clone()
    }

    fn next_script(&self) -> MockConnect {
        let queued = self
            .shared
            .scripts
            .lock()
            .get_mut(&self.params.session_id)
            .and_then(VecDeque::pop_front);
        if let Some(script) = queued {
            return script;
        }
        if let Some(script) = self.shared.default_script.lock().clone() {
            return script;
        }
        let external_id = self.state.lock().external_id.clone();
        if external_id.is_empty() {
            MockConnect::authenticating(&format!("QR-{}", self.params.session_id))
        } else {
            MockConnect::authenticated(&external_id)
        }
    }

    fn apply(&self, result: &ConnectResult) {
        let mut state = self.state.lock();
        if !result.external_id.is_empty() {
            state.external_id = result.external_id.clone();
        }
        match result.status {
            ConnectionStatus::Connected | ConnectionStatus::Authenticated => {
                state.connected = true;
                state.authenticated =
                    result.status == ConnectionStatus::Authenticated || !result.external_id.is_empty();
            }
            ConnectionStatus::Authenticating => {
                state.connected = true;
                state.authenticated = false;
            }
            ConnectionStatus::Connecting
            | ConnectionStatus::Disconnected
            | ConnectionStatus::Error => {
                state.connected = false;
                state.authenticated = false;
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state.lock().closed {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    // ── event emission ─────────────────────────────────────────────

    pub fn emit_connected(&self) {
        let external_id = self.state.lock().external_id.clone();
        if let Some(h) = self.handler() {
            h.on_connected(&self.params.session_id, &external_id);
        }
    }

    pub fn emit_disconnected(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.connected = false;
        }
        if let Some(h) = self.handler() {
            h.on_disconnected(&self.params.session_id, reason);
        }
    }

    pub fn emit_qr_code(&self, qr_code: &str) {
        if let Some(h) = self.handler() {
            h.on_qr_code(&self.params.session_id, qr_code);
        }
    }

    pub fn emit_authenticated(&self, external_id: &str) {
        {
            let mut state = self.state.lock();
            state.connected = true;
            state.authenticated = true;
            state.external_id = external_id.to_string();
        }
        if let Some(h) = self.handler() {
            h.on_authenticated(&self.params.session_id, external_id);
        }
    }

    pub fn emit_authentication_failed(&self, reason: &str) {
        if let Some(h) = self.handler() {
            h.on_authentication_failed(&self.params.session_id, reason);
        }
    }

    pub fn emit_message(&self, message: &IncomingMessage) {
        if let Some(h) = self.handler() {
            h.on_message(&self.params.session_id, message);
        }
    }

    pub fn emit_error(&self, error: &str) {
        if let Some(h) = self.handler() {
            h.on_error(&self.params.session_id, error);
        }
    }
}

async fn resolve(script: MockConnect, cancel: &CancellationToken) -> Result<ConnectResult, ClientError> {
    let mut current = script;
    loop {
        match current {
            MockConnect::Respond(result) => return Ok(result),
            MockConnect::Fail(e) => return Err(e),
            MockConnect::Delay(duration, inner) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(duration) => {}
                }
                current = *inner;
            }
            MockConnect::Hang => {
                cancel.cancelled().await;
                return Err(ClientError::Cancelled);
            }
        }
    }
}

#[async_trait]
impl ConnectionClient for MockClient {
    fn session_id(&self) -> &SessionId {
        &self.params.session_id
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<ConnectResult, ClientError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let _live = LiveGuard::enter(&self.shared);
        *self
            .shared
            .connects_by_session
            .lock()
            .entry(self.params.session_id.clone())
            .or_default() += 1;

        let script = self.next_script();
        let result = resolve(script, cancel).await?;
        self.apply(&result);
        Ok(result)
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_disconnect.lock().contains(&self.params.session_id) {
            return Err(ClientError::ConnectionFailed("scripted disconnect failure".into()));
        }
        let mut state = self.state.lock();
        state.connected = false;
        state.authenticated = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.connected && !state.closed
    }

    fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    async fn generate_qr(&self, cancel: &CancellationToken) -> Result<String, ClientError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if self.state.lock().authenticated {
            return Err(ClientError::Engine("already authenticated".into()));
        }
        let n = self.shared.qr_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("QR-{}-{n}", self.params.session_id))
    }

    async fn pair_phone(&self, cancel: &CancellationToken, phone: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if !self.state.lock().connected {
            return Err(ClientError::NotConnected);
        }
        self.shared
            .paired
            .lock()
            .push((self.params.session_id.clone(), phone.to_string()));
        Ok(())
    }

    async fn send_message(
        &self,
        cancel: &CancellationToken,
        to: &str,
        text: &str,
    ) -> Result<String, ClientError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        {
            let state = self.state.lock();
            if !state.connected {
                return Err(ClientError::NotConnected);
            }
            if !state.authenticated {
                return Err(ClientError::NotAuthenticated);
            }
        }
        self.shared
            .sent
            .lock()
            .push((self.params.session_id.clone(), to.to_string(), text.to_string()));
        let n = self.shared.msg_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("msg-{n}"))
    }

    fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn remove_event_handler(&self) {
        *self.handler.write() = None;
    }

    async fn close(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.connected = false;
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(engine: &MockEngine, external_id: &str) -> Arc<dyn ConnectionClient> {
        engine
            .create(ClientParams {
                session_id: SessionId::new(),
                external_id: external_id.into(),
                proxy: None,
            })
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl EventHandler for Recorder {
        fn on_connected(&self, _: &SessionId, external_id: &str) {
            self.calls.lock().push(format!("connected:{external_id}"));
        }
        fn on_disconnected(&self, _: &SessionId, reason: &str) {
            self.calls.lock().push(format!("disconnected:{reason}"));
        }
        fn on_qr_code(&self, _: &SessionId, qr: &str) {
            self.calls.lock().push(format!("qr:{qr}"));
        }
        fn on_authenticated(&self, _: &SessionId, external_id: &str) {
            self.calls.lock().push(format!("auth:{external_id}"));
        }
        fn on_authentication_failed(&self, _: &SessionId, reason: &str) {
            self.calls.lock().push(format!("auth_failed:{reason}"));
        }
        fn on_message(&self, _: &SessionId, message: &IncomingMessage) {
            self.calls.lock().push(format!("message:{}", message.body));
        }
        fn on_error(&self, _: &SessionId, error: &str) {
            self.calls.lock().push(format!("error:{error}"));
        }
    }

    #[tokio::test]
    async fn seeded_client_authenticates_by_default() {
        let engine = MockEngine::new();
        let c = client(&engine, "5511@net");
        let result = c.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, ConnectionStatus::Authenticated);
        assert_eq!(result.external_id, "5511@net");
        assert!(c.is_connected());
        assert!(c.is_authenticated());
    }

    #[tokio::test]
    async fn unseeded_client_asks_for_pairing() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        let result = c.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, ConnectionStatus::Authenticating);
        assert!(result.qr_code.starts_with("QR-"));
        assert!(!c.is_authenticated());
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order_then_default() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        let id = c.session_id().clone();
        engine.script(
            &id,
            vec![
                MockConnect::Fail(ClientError::ConnectionFailed("refused".into())),
                MockConnect::authenticated("77@net"),
            ],
        );
        engine.set_default(MockConnect::status(ConnectionStatus::Error));

        let cancel = CancellationToken::new();
        assert!(matches!(c.connect(&cancel).await, Err(ClientError::ConnectionFailed(_))));
        assert_eq!(c.connect(&cancel).await.unwrap().external_id, "77@net");
        assert_eq!(c.connect(&cancel).await.unwrap().status, ConnectionStatus::Error);
        assert_eq!(engine.connect_count(&id), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_resolves_after_sleep() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        engine.script(
            c.session_id(),
            vec![MockConnect::delayed(Duration::from_secs(5), MockConnect::authenticated("1@net"))],
        );
        let started = tokio::time::Instant::now();
        let result = c.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.external_id, "1@net");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn hang_returns_cancelled_on_cancel() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        engine.script(c.session_id(), vec![MockConnect::Hang]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert!(matches!(c.connect(&cancel).await, Err(ClientError::Cancelled)));
        assert_eq!(engine.stats().live_connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_drop_releases_live_counter() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        engine.script(c.session_id(), vec![MockConnect::Hang]);
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_secs(1), c.connect(&cancel)).await;
        assert!(outcome.is_err());
        let stats = engine.stats();
        assert_eq!(stats.live_connects, 0);
        assert_eq!(stats.peak_connects, 1);
        assert_eq!(stats.total_connects, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peak_tracks_concurrent_connects() {
        let engine = MockEngine::new();
        engine.set_default(MockConnect::delayed(
            Duration::from_millis(50),
            MockConnect::authenticated("x@net"),
        ));
        let clients: Vec<_> = (0..4).map(|_| client(&engine, "")).collect();
        let mut handles = Vec::new();
        for c in clients {
            handles.push(tokio::spawn(async move { c.connect(&CancellationToken::new()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let stats = engine.stats();
        assert_eq!(stats.total_connects, 4);
        assert_eq!(stats.live_connects, 0);
        assert!(stats.peak_connects >= 2, "peak was {}", stats.peak_connects);
    }

    #[tokio::test]
    async fn closed_client_rejects_calls() {
        let engine = MockEngine::new();
        let c = client(&engine, "5511@net");
        c.close().await.unwrap();
        c.close().await.unwrap();
        assert!(matches!(
            c.connect(&CancellationToken::new()).await,
            Err(ClientError::Closed)
        ));
        assert_eq!(engine.stats().closes, 1);
    }

    #[test]
    fn create_failure_is_scriptable() {
        let engine = MockEngine::new();
        let id = SessionId::new();
        engine.fail_create(&id);
        let result = engine.create(ClientParams::unauthenticated(id));
        assert!(matches!(result, Err(ClientError::Engine(_))));
        assert_eq!(engine.stats().clients_created, 0);
    }

    #[tokio::test]
    async fn send_requires_authentication() {
        let engine = MockEngine::new();
        let cancel = CancellationToken::new();

        let pending = client(&engine, "");
        pending.connect(&cancel).await.unwrap();
        assert!(matches!(
            pending.send_message(&cancel, "123", "hi").await,
            Err(ClientError::NotAuthenticated)
        ));

        let ready = client(&engine, "5511@net");
        ready.connect(&cancel).await.unwrap();
        let id = ready.send_message(&cancel, "123", "hi").await.unwrap();
        assert_eq!(id, "msg-1");
        assert_eq!(engine.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn pairing_and_qr() {
        let engine = MockEngine::new();
        let cancel = CancellationToken::new();
        let c = client(&engine, "");
        assert!(matches!(
            c.pair_phone(&cancel, "5511999").await,
            Err(ClientError::NotConnected)
        ));
        c.connect(&cancel).await.unwrap();
        c.pair_phone(&cancel, "5511999").await.unwrap();
        assert_eq!(engine.paired_phones()[0].1, "5511999");
        assert!(c.generate_qr(&cancel).await.unwrap().starts_with("QR-"));
    }

    #[tokio::test]
    async fn events_reach_installed_handler() {
        let engine = MockEngine::new();
        let c = client(&engine, "");
        let mock = engine.client(c.session_id()).unwrap();
        let recorder = Arc::new(Recorder::default());

        mock.emit_qr_code("ignored");
        c.set_event_handler(recorder.clone());
        assert!(mock.has_event_handler());

        mock.emit_qr_code("ABC");
        mock.emit_authenticated("9@net");
        mock.emit_message(&IncomingMessage {
            message_id: "m1".into(),
            from: "1".into(),
            body: "hello".into(),
            timestamp: chrono::Utc::now(),
        });
        mock.emit_disconnected("timeout");
        c.remove_event_handler();
        mock.emit_error("dropped");

        assert_eq!(
            *recorder.calls.lock(),
            vec!["qr:ABC", "auth:9@net", "message:hello", "disconnected:timeout"]
        );
        assert!(c.is_authenticated());
        assert!(!c.is_connected());
    }
}
