//! In-memory connector and session for testing.
//!
//! [`MockConnector`] implements [`Connector`] and hands out [`MockProtocol`]
//! sessions. Both are fully inspectable: every control statement is recorded,
//! sessions remember whether they were closed gracefully or aborted, and
//! failures can be injected at connect or execute time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use edb_protocol::{
    Address, ClientConfiguration, Connector, LogMessage, LogSink, Protocol, ProtocolError,
    QueryCache, QueryCodecs, ResolvedConnectConfig, SUGGESTED_POOL_CONCURRENCY, ServerSettings,
};
use parking_lot::Mutex;

/// Error code the mock uses for injected statement failures.
pub const INJECTED_ERROR_CODE: u32 = 0x0503_0001;

#[derive(Debug, Default)]
struct Latency {
    connect: Option<Duration>,
    execute: Option<Duration>,
    close: Option<Duration>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    settings: ServerSettings,
    failing_connects: usize,
    failing_statements: Vec<String>,
    sever_on_execute: bool,
    sessions: Vec<Arc<MockProtocol>>,
    statements: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ConnectorState>,
    latency: Latency,
    connect_attempts: AtomicUsize,
}

/// Builder for [`MockConnector`].
#[derive(Debug, Default)]
pub struct MockConnectorBuilder {
    settings: ServerSettings,
    latency: Latency,
}

impl MockConnectorBuilder {
    /// Create a builder for a connector with no settings and no latency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a server setting on every new session.
    #[must_use]
    pub fn with_setting(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key, value);
        self
    }

    /// Advertise a `suggested_pool_concurrency` setting.
    #[must_use]
    pub fn with_suggested_concurrency(self, concurrency: u64) -> Self {
        self.with_setting(SUGGESTED_POOL_CONCURRENCY, concurrency)
    }

    /// Delay every connection attempt.
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.latency.connect = Some(delay);
        self
    }

    /// Delay every statement.
    #[must_use]
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.latency.execute = Some(delay);
        self
    }

    /// Delay every graceful close.
    #[must_use]
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.latency.close = Some(delay);
        self
    }

    /// Build the connector.
    #[must_use]
    pub fn build(self) -> MockConnector {
        MockConnector {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectorState {
                    settings: self.settings,
                    ..ConnectorState::default()
                }),
                latency: self.latency,
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }
}

/// A connector that opens in-memory sessions.
///
/// Cloning is cheap; clones share sessions and recorded statements.
#[derive(Debug, Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl Default for MockConnector {
    fn default() -> Self {
        MockConnectorBuilder::new().build()
    }
}

impl MockConnector {
    /// Create a connector with default behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> MockConnectorBuilder {
        MockConnectorBuilder::new()
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.state.lock().failing_connects = count;
    }

    /// Fail every statement starting with `prefix` with a server error.
    pub fn fail_statement(&self, prefix: impl Into<String>) {
        self.shared
            .state
            .lock()
            .failing_statements
            .push(prefix.into());
    }

    /// Stop injecting statement failures.
    pub fn clear_failures(&self) {
        let mut state = self.shared.state.lock();
        state.failing_statements.clear();
        state.failing_connects = 0;
        state.sever_on_execute = false;
    }

    /// When set, the next statement on any session severs that session.
    pub fn set_broken(&self, broken: bool) {
        self.shared.state.lock().sever_on_execute = broken;
    }

    /// Replace the settings advertised to sessions opened from now on.
    pub fn set_settings(&self, settings: ServerSettings) {
        self.shared.state.lock().settings = settings;
    }

    /// Number of connection attempts, including failed ones.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every session opened so far, in order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<MockProtocol>> {
        self.shared.state.lock().sessions.clone()
    }

    /// Number of sessions that are not closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.shared
            .state
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Every control statement executed on any session, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.shared.state.lock().statements.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &Address,
        _config: &ClientConfiguration,
        params: &ResolvedConnectConfig,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Arc<dyn Protocol>, ProtocolError> {
        let attempt = self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.shared.latency.connect {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            tracing::debug!(attempt, %address, "mock connect failure injected");
            return Err(ProtocolError::ConnectionFailed(format!(
                "injected failure connecting to {address}"
            )));
        }

        let session = Arc::new(MockProtocol {
            id: state.sessions.len(),
            database: params.database.clone(),
            settings: state.settings.clone(),
            shared: Arc::clone(&self.shared),
            log_sink,
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            closed_gracefully: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            last_status: Mutex::new(None),
            statements: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
        });
        state.sessions.push(Arc::clone(&session));
        tracing::debug!(session = session.id, %address, "mock session opened");
        Ok(session)
    }
}

/// One in-memory session.
pub struct MockProtocol {
    id: usize,
    database: String,
    settings: ServerSettings,
    shared: Arc<Shared>,
    log_sink: Arc<dyn LogSink>,
    closed: AtomicBool,
    aborted: AtomicBool,
    closed_gracefully: AtomicBool,
    in_transaction: AtomicBool,
    last_status: Mutex<Option<Bytes>>,
    statements: Mutex<Vec<String>>,
    queries: AtomicUsize,
}

impl std::fmt::Debug for MockProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProtocol")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("closed", &self.is_closed())
            .field("in_transaction", &self.is_in_transaction())
            .finish_non_exhaustive()
    }
}

impl MockProtocol {
    /// Sequence number of this session within its connector.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Database the session was opened against.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Simulate the server dropping the session.
    pub fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.in_transaction.store(false, Ordering::SeqCst);
    }

    /// Whether [`Protocol::abort`] was called.
    #[must_use]
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether [`Protocol::close`] completed.
    #[must_use]
    pub fn was_closed_gracefully(&self) -> bool {
        self.closed_gracefully.load(Ordering::SeqCst)
    }

    /// Push a server log message to the session's sink.
    pub fn emit_log(&self, message: LogMessage) {
        self.log_sink.on_log_message(message);
    }

    /// Control statements executed on this session, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Number of regular queries executed on this session.
    #[must_use]
    pub fn execute_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn before_statement(&self, statement: &str) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if let Some(delay) = self.shared.latency.execute {
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }
        }

        let state = self.shared.state.lock();
        if state.sever_on_execute {
            drop(state);
            self.sever();
            return Err(ProtocolError::ConnectionClosed);
        }
        if state
            .failing_statements
            .iter()
            .any(|prefix| statement.starts_with(prefix.as_str()))
        {
            return Err(ProtocolError::Server {
                code: INJECTED_ERROR_CODE,
                message: format!("injected failure for `{statement}`"),
            });
        }
        Ok(())
    }
}

fn status_of(statement: &str) -> &'static str {
    const TAGS: &[&str] = &[
        "START TRANSACTION",
        "DECLARE SAVEPOINT",
        "RELEASE SAVEPOINT",
        "ROLLBACK TO SAVEPOINT",
        "COMMIT",
        "ROLLBACK",
    ];
    TAGS.iter()
        .copied()
        .find(|tag| statement.starts_with(tag))
        .unwrap_or("OK")
}

#[async_trait]
impl Protocol for MockProtocol {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn settings(&self) -> ServerSettings {
        self.settings.clone()
    }

    fn last_status(&self) -> Option<Bytes> {
        self.last_status.lock().clone()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.sever();
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Ok(());
        }
        if let Some(delay) = self.shared.latency.close {
            tokio::time::sleep(delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_gracefully.store(true, Ordering::SeqCst);
        }
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn privileged_execute(&self, statement: &str) -> Result<(), ProtocolError> {
        self.before_statement(statement).await?;

        let status = status_of(statement);
        match status {
            "START TRANSACTION" => self.in_transaction.store(true, Ordering::SeqCst),
            "COMMIT" | "ROLLBACK" => self.in_transaction.store(false, Ordering::SeqCst),
            _ => {}
        }
        *self.last_status.lock() = Some(Bytes::from_static(status.as_bytes()));
        self.statements.lock().push(statement.to_owned());
        self.shared.state.lock().statements.push(statement.to_owned());
        Ok(())
    }

    async fn execute(&self, query: &str, cache: &QueryCache) -> Result<(), ProtocolError> {
        self.before_statement(query).await?;

        if cache.query_cache().get(query).is_none() {
            let descriptor = Bytes::copy_from_slice(query.as_bytes());
            cache
                .codecs_registry()
                .insert(descriptor.clone(), Bytes::from_static(b"codec"));
            cache.query_cache().insert(
                query,
                QueryCodecs {
                    input: Bytes::from_static(b"\x00"),
                    output: descriptor,
                },
            );
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        *self.last_status.lock() = Some(Bytes::from_static(b"OK"));
        Ok(())
    }
}
