//! A single live session to the server.
//!
//! A [`Connection`] owns one [`Protocol`] handle and answers liveness and
//! metadata queries about it. Connections created by a pool carry a
//! [`HolderLink`] naming the pool slot that owns them; when a linked
//! connection is terminated it reports back through [`ReleaseOnClose`] so the
//! slot can be returned to the pool without polling.
//!
//! Cloning a `Connection` is cheap and yields a handle to the same session.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use edb_protocol::{
    Address, ClientConfiguration, Connector, LogMessage, LogSink, Protocol, QueryCache,
    ResolvedConnectConfig, ServerSettings,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::transaction::IsolationLevel;

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pause between attempts while waiting for an unavailable server.
const RECONNECT_PAUSE: Duration = Duration::from_millis(10);

/// Callback receiving server log messages.
pub trait LogListener: Send + Sync {
    /// Handle one message. Errors are logged and do not affect other listeners.
    fn on_log(&self, connection: &Connection, message: &LogMessage) -> std::result::Result<(), BoxError>;
}

impl<F> LogListener for F
where
    F: Fn(&Connection, &LogMessage) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn on_log(&self, connection: &Connection, message: &LogMessage) -> std::result::Result<(), BoxError> {
        self(connection, message)
    }
}

/// Handle returned by [`Connection::add_log_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiver of the "connection closed while checked out" notification.
///
/// Implemented by the pool; `slot` is the index of the holder that owned the
/// connection.
pub trait ReleaseOnClose: Send + Sync {
    /// Return the holder at `slot` to the pool and drop its connection.
    fn release_on_close(&self, slot: usize);
}

/// Back-reference from a connection to the pool slot that owns it.
#[derive(Clone)]
pub struct HolderLink {
    pool_id: u64,
    slot: usize,
    pool: Weak<dyn ReleaseOnClose>,
}

impl HolderLink {
    /// Create a link to `slot` of the pool identified by `pool_id`.
    pub fn new(pool_id: u64, slot: usize, pool: Weak<dyn ReleaseOnClose>) -> Self {
        Self { pool_id, slot, pool }
    }

    /// Identifier of the owning pool.
    #[must_use]
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Index of the owning holder.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    fn notify_closed(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release_on_close(self.slot);
        }
    }
}

impl fmt::Debug for HolderLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HolderLink")
            .field("pool_id", &self.pool_id)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Attributes of the top-level transaction open on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TopTransaction {
    pub(crate) tx_id: u64,
    pub(crate) isolation: Option<IsolationLevel>,
    pub(crate) readonly: Option<bool>,
    pub(crate) deferrable: Option<bool>,
}

struct ConnectionInner {
    id: u64,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    addr: Address,
    config: ClientConfiguration,
    params: ResolvedConnectConfig,
    cache: QueryCache,
    log_listeners: Mutex<Vec<(ListenerId, Arc<dyn LogListener>)>>,
    next_listener_id: AtomicU64,
    holder: Mutex<Option<HolderLink>>,
    top_xact: Mutex<Option<TopTransaction>>,
    next_unique_id: AtomicU64,
}

struct ConnectionLogSink(Weak<ConnectionInner>);

impl LogSink for ConnectionLogSink {
    fn on_log_message(&self, message: LogMessage) {
        if let Some(inner) = self.0.upgrade() {
            Connection { inner }.dispatch_log_message(&message);
        }
    }
}

/// A live session to the server.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a new session through `connector`.
    ///
    /// Each attempt is bounded by `config.connect_timeout`. Refused
    /// connections are retried until `config.wait_until_available` has
    /// elapsed.
    pub async fn connect(
        connector: &dyn Connector,
        addr: Address,
        config: ClientConfiguration,
        params: ResolvedConnectConfig,
        cache: QueryCache,
    ) -> Result<Self> {
        let inner = Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            protocol: Mutex::new(None),
            addr,
            config,
            params,
            cache,
            log_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            holder: Mutex::new(None),
            top_xact: Mutex::new(None),
            next_unique_id: AtomicU64::new(0),
        });

        let deadline = Instant::now() + inner.config.wait_until_available;
        let mut attempt = 0u32;
        let protocol = loop {
            attempt += 1;
            let sink: Arc<dyn LogSink> = Arc::new(ConnectionLogSink(Arc::downgrade(&inner)));
            let timeout = inner.config.connect_timeout;
            let result = tokio::time::timeout(
                timeout,
                connector.connect(&inner.addr, &inner.config, &inner.params, sink),
            )
            .await;

            let err = match result {
                Ok(Ok(protocol)) => break protocol,
                Ok(Err(e)) => Error::from(e),
                Err(_) => Error::Timeout(timeout),
            };
            if !err.is_connection_error() || Instant::now() + RECONNECT_PAUSE >= deadline {
                tracing::debug!(addr = %inner.addr, attempt, error = %err, "connect failed");
                return Err(err);
            }
            tracing::trace!(addr = %inner.addr, attempt, error = %err, "server unavailable, retrying");
            tokio::time::sleep(RECONNECT_PAUSE).await;
        };

        *inner.protocol.lock() = Some(protocol);
        tracing::debug!(connection = inner.id, addr = %inner.addr, "connection established");
        Ok(Self { inner })
    }

    /// Process-unique identifier of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.inner.protocol.lock().clone()
    }

    fn live_protocol(&self) -> Result<Arc<dyn Protocol>> {
        match self.protocol() {
            Some(p) if !p.is_closed() => Ok(p),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Whether the session is gone or reports closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.protocol().is_none_or(|p| p.is_closed())
    }

    /// Whether the server reports an open transaction.
    pub fn is_in_transaction(&self) -> Result<bool> {
        self.protocol()
            .map(|p| p.is_in_transaction())
            .ok_or(Error::ConnectionClosed)
    }

    /// Settings advertised by the server.
    pub fn settings(&self) -> Result<ServerSettings> {
        self.protocol()
            .map(|p| p.settings())
            .ok_or(Error::ConnectionClosed)
    }

    /// Status of the last completed statement.
    #[must_use]
    pub fn last_status(&self) -> Option<String> {
        self.protocol()?
            .last_status()
            .map(|status| String::from_utf8_lossy(&status).into_owned())
    }

    /// Address this connection was opened against.
    #[must_use]
    pub fn connected_addr(&self) -> &Address {
        &self.inner.addr
    }

    /// Database this connection was opened against.
    #[must_use]
    pub fn dbname(&self) -> &str {
        &self.inner.params.database
    }

    /// Resolved parameters used to open this connection.
    #[must_use]
    pub fn params(&self) -> &ResolvedConnectConfig {
        &self.inner.params
    }

    /// Client configuration used to open this connection.
    #[must_use]
    pub fn config(&self) -> &ClientConfiguration {
        &self.inner.config
    }

    /// Codec caches shared with the rest of the pool.
    #[must_use]
    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Whether `other` is a handle to the same session.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a log listener.
    pub fn add_log_listener(&self, listener: impl LogListener + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.log_listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a log listener. Unknown ids are ignored.
    pub fn remove_log_listener(&self, id: ListenerId) {
        self.inner.log_listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn dispatch_log_message(&self, message: &LogMessage) {
        let listeners: Vec<_> = self
            .inner
            .log_listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if let Err(e) = listener.on_log(self, message) {
                tracing::warn!(connection = self.inner.id, error = %e, "log listener failed");
            }
        }
    }

    /// Abort the session and detach it from its pool slot.
    ///
    /// Idempotent. If the connection was owned by a pool holder, the holder
    /// is notified exactly once.
    pub fn terminate(&self) {
        if !self.is_closed() {
            if let Some(p) = self.protocol() {
                p.abort();
            }
        }
        self.cleanup();
    }

    fn cleanup(&self) {
        self.inner.log_listeners.lock().clear();
        let link = self.inner.holder.lock().take();
        if let Some(link) = link {
            link.notify_closed();
        }
    }

    /// Close the session gracefully.
    ///
    /// If `timeout` elapses first the session is terminated and
    /// [`Error::Timeout`] returned.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let Some(p) = self.protocol().filter(|p| !p.is_closed()) else {
            self.cleanup();
            return Ok(());
        };

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, p.close()).await {
                Ok(r) => r.map_err(Error::from),
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => p.close().await.map_err(Error::from),
        };

        if let Err(e) = result {
            tracing::debug!(connection = self.inner.id, error = %e, "graceful close failed, terminating");
            self.terminate();
            return Err(e);
        }
        self.cleanup();
        Ok(())
    }

    /// Execute a transaction control statement.
    pub async fn privileged_execute(&self, statement: &str) -> Result<()> {
        let p = self.live_protocol()?;
        tracing::trace!(connection = self.inner.id, statement, "privileged execute");
        p.privileged_execute(statement)
            .await
            .map_err(|e| self.on_protocol_error(&p, e))
    }

    /// Execute a query through the pool's codec caches.
    pub async fn execute(&self, query: &str) -> Result<()> {
        let p = self.live_protocol()?;
        p.execute(query, &self.inner.cache)
            .await
            .map_err(|e| self.on_protocol_error(&p, e))
    }

    fn on_protocol_error(&self, p: &Arc<dyn Protocol>, e: edb_protocol::ProtocolError) -> Error {
        if e.is_connection_error() {
            // Leave holder bookkeeping to the pool's release path.
            p.abort();
        }
        Error::from(e)
    }

    /// Link this connection to a pool slot.
    pub fn attach_holder(&self, link: HolderLink) -> Result<()> {
        let mut holder = self.inner.holder.lock();
        if holder.is_some() {
            return Err(Error::InternalClient(
                "connection is already owned by a pool holder".into(),
            ));
        }
        *holder = Some(link);
        Ok(())
    }

    /// The pool slot that owns this connection, if any.
    #[must_use]
    pub fn holder_link(&self) -> Option<HolderLink> {
        self.inner.holder.lock().clone()
    }

    /// Unlink this connection from its pool slot without notifying it.
    pub fn detach_holder(&self) -> Option<HolderLink> {
        self.inner.holder.lock().take()
    }

    /// Install `top` as the top-level transaction, or return the one that
    /// is already open.
    pub(crate) fn claim_top_transaction(&self, top: TopTransaction) -> Option<TopTransaction> {
        let mut current = self.inner.top_xact.lock();
        match *current {
            Some(existing) => Some(existing),
            None => {
                *current = Some(top);
                None
            }
        }
    }

    /// Clear the top-level transaction if it is `tx_id`.
    pub(crate) fn clear_top_transaction(&self, tx_id: u64) {
        let mut top = self.inner.top_xact.lock();
        if top.is_some_and(|t| t.tx_id == tx_id) {
            *top = None;
        }
    }

    /// Connection-unique identifier such as `_edb_savepoint_1f_`.
    pub(crate) fn next_unique_id(&self, prefix: &str) -> String {
        let n = self.inner.next_unique_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("_edb_{prefix}_{n:x}_")
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("database", &self.inner.params.database)
            .field("closed", &self.is_closed())
            .field("holder", &self.holder_link())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use edb_protocol::{LogSeverity, ProtocolError};
    use edb_testing::MockConnector;
    use edb_testing::fixtures::{test_address, test_config, test_params};

    use super::*;

    async fn connect(connector: &MockConnector) -> Connection {
        Connection::connect(
            connector,
            test_address(),
            test_config(),
            test_params(),
            QueryCache::new(),
        )
        .await
        .unwrap()
    }

    #[derive(Default)]
    struct CountingPool {
        released: Mutex<Vec<usize>>,
    }

    impl ReleaseOnClose for CountingPool {
        fn release_on_close(&self, slot: usize) {
            self.released.lock().push(slot);
        }
    }

    #[tokio::test]
    async fn test_terminate_notifies_holder_once() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        let pool = Arc::new(CountingPool::default());
        let weak: Weak<dyn ReleaseOnClose> = Arc::downgrade(&pool) as Weak<dyn ReleaseOnClose>;
        conn.attach_holder(HolderLink::new(7, 3, weak)).unwrap();

        conn.terminate();
        conn.terminate();

        assert!(conn.is_closed());
        assert!(conn.holder_link().is_none());
        assert_eq!(*pool.released.lock(), vec![3]);
        assert!(connector.sessions()[0].was_aborted());
    }

    #[tokio::test]
    async fn test_attach_twice_is_internal_error() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        let pool: Arc<dyn ReleaseOnClose> = Arc::new(CountingPool::default());
        conn.attach_holder(HolderLink::new(1, 0, Arc::downgrade(&pool)))
            .unwrap();
        let err = conn
            .attach_holder(HolderLink::new(1, 1, Arc::downgrade(&pool)))
            .unwrap_err();
        assert!(matches!(err, Error::InternalClient(_)));
    }

    #[tokio::test]
    async fn test_log_listener_failure_is_isolated() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        let seen = Arc::new(AtomicUsize::new(0));

        conn.add_log_listener(|_: &Connection, _: &LogMessage| -> std::result::Result<(), BoxError> {
            Err("listener exploded".into())
        });
        let counter = Arc::clone(&seen);
        let id = conn.add_log_listener(move |_: &Connection, msg: &LogMessage| -> std::result::Result<(), BoxError> {
            assert_eq!(msg.code, 42);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let session = connector.sessions()[0].clone();
        session.emit_log(LogMessage::new(LogSeverity::Notice, 42, "hello"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        conn.remove_log_listener(id);
        session.emit_log(LogMessage::new(LogSeverity::Notice, 42, "again"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_error_closes_session() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        connector.sessions()[0].sever();

        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_server_error_keeps_session() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        connector.fail_statement("SELECT");

        let err = conn.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Server { .. })));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_metadata() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        assert_eq!(conn.dbname(), "edgedb");
        assert_eq!(conn.connected_addr(), &test_address());
        assert_eq!(conn.last_status(), None);
        assert!(!conn.is_in_transaction().unwrap());

        conn.privileged_execute("START TRANSACTION;").await.unwrap();
        assert_eq!(conn.last_status().as_deref(), Some("START TRANSACTION"));
        assert!(conn.is_in_transaction().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_terminates() {
        let connector = MockConnector::builder()
            .with_close_delay(Duration::from_secs(5))
            .build();
        let conn = connect(&connector).await;

        let err = conn.close(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(conn.is_closed());
        assert!(connector.sessions()[0].was_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_available() {
        let connector = MockConnector::new();
        connector.fail_next_connects(3);
        let conn = connect(&connector).await;
        assert!(!conn.is_closed());
        assert_eq!(connector.connect_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_wait_until_available() {
        let connector = MockConnector::new();
        connector.fail_next_connects(usize::MAX);
        let config = ClientConfiguration {
            wait_until_available: Duration::ZERO,
            ..test_config()
        };
        let err = Connection::connect(
            &connector,
            test_address(),
            config,
            test_params(),
            QueryCache::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unique_ids() {
        let connector = MockConnector::new();
        let conn = connect(&connector).await;
        assert_eq!(conn.next_unique_id("savepoint"), "_edb_savepoint_1_");
        assert_eq!(conn.next_unique_id("savepoint"), "_edb_savepoint_2_");
    }
}
