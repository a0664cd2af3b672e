//! Connection pool implementation.
//!
//! The pool owns an arena of [`Holder`]s indexed by slot and a FIFO queue of
//! free slot indexes. Connections point back at their slot through a
//! [`HolderLink`](edb_client::HolderLink), so a connection that breaks while
//! checked out returns its slot without the pool polling for liveness.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use edb_client::{ConnectArgs, Connection, ReleaseOnClose};
use edb_protocol::{Address, ClientConfiguration, Connector, QueryCache, ResolvedConnectConfig};
use parking_lot::{Mutex, RwLock};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::holder::{Holder, HolderQueue};
use crate::lifecycle::{ConnectionHook, Hooks};
use crate::metrics::{MetricsRecorder, PoolMetrics};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Address, configuration and parameters of the first successful connect.
#[derive(Debug, Clone)]
struct WorkingParams {
    addr: Address,
    config: ClientConfiguration,
    params: ResolvedConnectConfig,
}

#[derive(Debug)]
struct PoolState {
    connect_args: ConnectArgs,
    working: Option<WorkingParams>,
    concurrency: usize,
    cache: QueryCache,
}

/// State shared by every handle to one pool.
pub(crate) struct PoolShared {
    pub(crate) id: u64,
    connector: Arc<dyn Connector>,
    pub(crate) hooks: Hooks,
    config: PoolConfig,
    state: Mutex<PoolState>,
    holders: RwLock<Vec<Arc<Holder>>>,
    pub(crate) queue: HolderQueue,
    generation: AtomicU64,
    first_connect: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    closed: AtomicBool,
    pub(crate) metrics: MetricsRecorder,
}

impl PoolShared {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn holder(&self, slot: usize) -> Result<Arc<Holder>, PoolError> {
        self.holders
            .read()
            .get(slot)
            .cloned()
            .ok_or_else(|| PoolError::Internal(format!("no holder at slot {slot}")))
    }

    fn check_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosing);
        }
        Ok(())
    }

    /// Open a connection for a holder and run the `on_connect` hook.
    ///
    /// The first call resolves the connect arguments; later calls reuse the
    /// address and parameters that worked.
    pub(crate) async fn get_new_connection(&self) -> Result<Connection, PoolError> {
        let working = self.state.lock().working.clone();
        let con = match working {
            Some(working) => self.connect_with(working).await?,
            None => self.maybe_get_first_connection().await?,
        };

        let mut fresh = FreshConnection {
            con,
            pool: self,
            armed: true,
        };
        self.hooks.on_connect(&fresh.con).await?;
        fresh.armed = false;
        Ok(fresh.con.clone())
    }

    async fn maybe_get_first_connection(&self) -> Result<Connection, PoolError> {
        let _first = self.first_connect.lock().await;
        let working = self.state.lock().working.clone();
        match working {
            Some(working) => self.connect_with(working).await,
            None => self.get_first_connection().await,
        }
    }

    async fn get_first_connection(&self) -> Result<Connection, PoolError> {
        let (connect_args, cache) = {
            let state = self.state.lock();
            (state.connect_args.clone(), state.cache.clone())
        };
        let (params, config) = connect_args.resolve()?;
        let con = Connection::connect(
            self.connector.as_ref(),
            params.address.clone(),
            config.clone(),
            params.clone(),
            cache,
        )
        .await?;
        self.metrics.connection_created();

        self.state.lock().working = Some(WorkingParams {
            addr: con.connected_addr().clone(),
            config,
            params,
        });
        tracing::info!(pool = self.id, addr = %con.connected_addr(), "first connection established");

        let suggested = con
            .settings()
            .ok()
            .and_then(|settings| settings.suggested_pool_concurrency());
        if let (None, Some(suggested)) = (self.config.concurrency, suggested) {
            self.state.lock().concurrency = suggested;
            self.resize_holder_pool();
        }
        Ok(con)
    }

    async fn connect_with(&self, working: WorkingParams) -> Result<Connection, PoolError> {
        let cache = self.state.lock().cache.clone();
        let con = Connection::connect(
            self.connector.as_ref(),
            working.addr,
            working.config,
            working.params,
            cache,
        )
        .await?;
        self.metrics.connection_created();
        Ok(con)
    }

    /// Grow the holder arena to the target concurrency.
    fn resize_holder_pool(&self) {
        let target = self.state.lock().concurrency;
        let mut holders = self.holders.write();
        let current = holders.len();
        if target > current {
            for slot in current..target {
                holders.push(Arc::new(Holder::new(slot)));
                self.queue.push(slot);
            }
            tracing::info!(pool = self.id, concurrency = target, "holder pool resized");
        } else if target < current {
            tracing::debug!(
                pool = self.id,
                concurrency = target,
                holders = current,
                "shrinking the holder pool is not supported, keeping existing holders"
            );
        }
    }
}

impl ReleaseOnClose for PoolShared {
    fn release_on_close(&self, slot: usize) {
        let holder = self.holders.read().get(slot).cloned();
        if let Some(holder) = holder {
            tracing::debug!(pool = self.id, slot, "connection closed while checked out");
            holder.release_on_close(self);
        }
    }
}

/// Terminates a new connection unless it is handed to a holder.
struct FreshConnection<'a> {
    con: Connection,
    pool: &'a PoolShared,
    armed: bool,
}

impl Drop for FreshConnection<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(pool = self.pool.id, connection = self.con.id(), "new connection not handed to a holder, terminating");
            self.con.terminate();
            self.pool.metrics.connection_closed();
        }
    }
}

/// Returns a popped slot to the queue unless the acquire completes.
struct CheckoutGuard<'a> {
    holder: &'a Holder,
    pool: &'a PoolShared,
    armed: bool,
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.holder.release_inner(self.pool);
        }
    }
}

/// A connection pool.
///
/// Cloning is cheap; all clones share the same holders and queue.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Check out a connection.
    ///
    /// Waits in FIFO order for a free holder. `timeout` overrides the
    /// configured acquire timeout and bounds the wait and any reconnect.
    /// A caller abandoned while waiting takes nothing from the queue.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Connection, PoolError> {
        self.shared.check_open()?;
        let timeout = timeout.or(self.shared.config.acquire_timeout);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_inner())
                .await
                .unwrap_or(Err(PoolError::AcquisitionTimeout(limit))),
            None => self.acquire_inner().await,
        };

        match &result {
            Ok(con) => {
                self.shared.metrics.acquired();
                tracing::trace!(pool = self.shared.id, connection = con.id(), "connection acquired");
            }
            Err(e) => {
                self.shared.metrics.acquire_failed();
                tracing::debug!(pool = self.shared.id, error = %e, "acquire failed");
            }
        }
        result
    }

    async fn acquire_inner(&self) -> Result<Connection, PoolError> {
        let shared = &self.shared;
        let slot = shared.queue.pop().await.map_err(|e| {
            if shared.closing.load(Ordering::Acquire) {
                PoolError::PoolClosing
            } else {
                e
            }
        })?;
        let holder = shared.holder(slot)?;
        holder.mark_checked_out();
        let mut guard = CheckoutGuard {
            holder: &holder,
            pool: shared,
            armed: true,
        };

        shared.check_open()?;
        let con = holder.acquire(shared).await?;
        holder.set_timeout(shared.config.release_timeout);
        guard.armed = false;
        Ok(con)
    }

    /// Check out a connection wrapped in a guard that returns it on drop.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        let conn = self.acquire(None).await?;
        Ok(PooledConnection {
            conn,
            pool: self.clone(),
            done: false,
        })
    }

    /// Return a connection to the pool.
    ///
    /// Releasing a connection that is already back in the pool is a no-op.
    /// The release runs on its own task, so cancelling the caller cannot
    /// strand the holder.
    pub async fn release(&self, connection: &Connection) -> Result<(), PoolError> {
        let Some(link) = connection.holder_link() else {
            // Already released.
            return Ok(());
        };
        if link.pool_id() != self.shared.id {
            return Err(PoolError::Interface(format!(
                "Pool::release() received invalid connection: {connection:?} is not a member of this pool"
            )));
        }

        let holder = self.shared.holder(link.slot())?;
        if holder.is_free() || !holder.owns(connection) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { holder.release(&shared).await })
            .await
            .map_err(|e| PoolError::Internal(format!("release task failed: {e}")))?
    }

    /// Target number of connections.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.shared.state.lock().concurrency
    }

    /// Number of holders waiting in the queue.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.shared.queue.len()
    }

    /// Current generation. Connections opened under an older generation are
    /// replaced on their next acquire or release.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    /// Mark every existing connection as expired.
    ///
    /// Nothing is closed here; each holder reconnects lazily.
    pub fn expire_connections(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(pool = self.shared.id, generation, "connections expired");
    }

    /// Make sure the pool has connected at least once.
    ///
    /// Succeeds right away if a holder has a live connection. Otherwise a
    /// free holder is connected. Checked-out holders are never touched,
    /// since their callers still own them; if every holder is checked out
    /// and the pool already knows a working address there is nothing to do.
    /// Before the first connect, waits for a free holder like
    /// [`acquire`](Self::acquire).
    pub async fn ensure_connected(&self) -> Result<(), PoolError> {
        self.shared.check_open()?;
        if self.shared.holders.read().iter().any(|h| h.is_connected()) {
            return Ok(());
        }

        match self.shared.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.connect_free_holder())
                .await
                .unwrap_or(Err(PoolError::AcquisitionTimeout(limit))),
            None => self.connect_free_holder().await,
        }
    }

    async fn connect_free_holder(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        let slot = match shared.queue.try_pop() {
            Some(slot) => slot,
            None if shared.state.lock().working.is_some() => return Ok(()),
            None => shared.queue.pop().await?,
        };
        let holder = shared.holder(slot)?;
        holder.mark_checked_out();
        // Stays armed: the holder goes back on the queue when this returns.
        let _guard = CheckoutGuard {
            holder: &holder,
            pool: shared,
            armed: true,
        };

        if !holder.is_connected() {
            if let Some(broken) = holder.take_connection() {
                broken.terminate();
                shared.metrics.connection_closed();
            }
            holder.connect(shared).await?;
        }
        Ok(())
    }

    /// Replace the connect arguments.
    ///
    /// The codec caches are replaced and the next new connection resolves
    /// the arguments from scratch. Live connections are kept until replaced.
    pub fn set_connect_args(&self, connect_args: ConnectArgs) {
        let mut state = self.shared.state.lock();
        state.connect_args = connect_args;
        state.cache = QueryCache::new();
        state.working = None;
        tracing::debug!(pool = self.shared.id, "connect arguments replaced");
    }

    /// The codec caches handed to new connections.
    #[must_use]
    pub fn query_cache(&self) -> QueryCache {
        self.shared.state.lock().cache.clone()
    }

    /// Counters collected since the pool was built.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics.snapshot()
    }

    /// Whether the pool has been closed or terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether a graceful close is in progress.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Terminate every connection and mark the pool closed. Idempotent.
    pub fn terminate(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let holders = self.shared.holders.read().clone();
        for holder in &holders {
            holder.terminate();
        }
        self.shared.queue.close();
        tracing::info!(pool = self.shared.id, "pool terminated");
    }

    /// Close the pool gracefully.
    ///
    /// Waits until every connection is released, then closes them. If the
    /// configured close timeout elapses first, the pool is terminated and
    /// [`PoolError::CloseTimeout`] returned. The pool is closed afterwards
    /// either way.
    pub async fn close(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.closing.store(true, Ordering::Release);
        tracing::info!(pool = shared.id, "closing pool");

        let result = match shared.config.close_timeout {
            Some(limit) => tokio::time::timeout(limit, self.close_gracefully())
                .await
                .map_err(|_| PoolError::CloseTimeout(limit)),
            None => {
                self.close_gracefully().await;
                Ok(())
            }
        };

        if let Err(e) = &result {
            tracing::warn!(pool = shared.id, error = %e, "graceful close failed, terminating pool");
            self.terminate();
        }
        shared.queue.close();
        shared.closed.store(true, Ordering::Release);
        shared.closing.store(false, Ordering::Release);
        result
    }

    async fn close_gracefully(&self) {
        let shared = &self.shared;
        let holders = shared.holders.read().clone();

        let released = async {
            for holder in &holders {
                holder.wait_until_released().await;
            }
        };
        tokio::pin!(released);
        let warn_after = shared.config.close_warning_after;
        tokio::select! {
            () = &mut released => {}
            () = tokio::time::sleep(warn_after) => {
                tracing::warn!(
                    pool = shared.id,
                    waited = ?warn_after,
                    "Pool::close() is taking over {warn_after:?}; make sure all acquired \
                     connections are released, or call Pool::terminate() to force"
                );
                released.await;
            }
        }

        for holder in &holders {
            holder.close(shared, true, None).await;
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("concurrency", &self.concurrency())
            .field("free", &self.free_size())
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`Pool`].
#[derive(Default)]
#[must_use]
pub struct PoolBuilder {
    connect_args: ConnectArgs,
    config: PoolConfig,
    hooks: Hooks,
    connector: Option<Arc<dyn Connector>>,
}

impl PoolBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connector used to open sessions.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set the connect arguments.
    pub fn connect_args(mut self, connect_args: ConnectArgs) -> Self {
        self.connect_args = connect_args;
        self
    }

    /// Replace the whole pool configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Pin the number of connections.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config = self.config.concurrency(concurrency);
        self
    }

    /// Set the default acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.acquire_timeout(timeout);
        self
    }

    /// Set the time allowed for closing an expired connection on release.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.release_timeout(timeout);
        self
    }

    /// Set the time allowed for [`Pool::close`].
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.close_timeout(timeout);
        self
    }

    /// Run `hook` once for every new physical connection.
    pub fn on_connect(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    /// Run `hook` every time a connection is handed out.
    pub fn on_acquire(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.hooks.on_acquire = Some(Arc::new(hook));
        self
    }

    /// Run `hook` every time a connection is handed back.
    pub fn on_release(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.hooks.on_release = Some(Arc::new(hook));
        self
    }

    /// Build the pool.
    ///
    /// No connection is opened here. Until the first connect the pool has
    /// one holder per pinned connection, or a single holder when the size is
    /// left to the server.
    pub fn build(self) -> Result<Pool, PoolError> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or_else(|| PoolError::Configuration("a connector is required".into()))?;
        self.connect_args.resolve()?;

        let concurrency = self.config.concurrency.unwrap_or(1);
        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            hooks: self.hooks,
            config: self.config,
            state: Mutex::new(PoolState {
                connect_args: self.connect_args,
                working: None,
                concurrency,
                cache: QueryCache::new(),
            }),
            holders: RwLock::new(Vec::new()),
            queue: HolderQueue::new(),
            generation: AtomicU64::new(0),
            first_connect: tokio::sync::Mutex::new(()),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics: MetricsRecorder::new(),
        });
        shared.resize_holder_pool();

        tracing::debug!(
            pool = shared.id,
            concurrency,
            hooks = ?shared.hooks,
            "connection pool created"
        );
        Ok(Pool { shared })
    }
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("connect_args", &self.connect_args)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dereferences to [`Connection`]. Prefer [`release`](Self::release); when
/// the guard is dropped instead, the release is spawned on the current
/// runtime. A connection dropped inside a transaction, or outside any
/// runtime, is terminated.
pub struct PooledConnection {
    conn: Connection,
    pool: Pool,
    done: bool,
}

impl PooledConnection {
    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) -> Result<(), PoolError> {
        self.done = true;
        self.pool.release(&self.conn).await
    }

    /// Take the connection out of the pool.
    ///
    /// The holder is returned to the pool without a connection and will
    /// open a new one when next acquired.
    pub fn detach(mut self) -> Connection {
        self.done = true;
        let conn = self.conn.clone();
        if let Some(link) = conn.holder_link() {
            if let Ok(holder) = self.pool.shared.holder(link.slot()) {
                if holder.owns(&conn) {
                    holder.take_connection();
                    holder.release_inner(&self.pool.shared);
                }
            }
        }
        conn
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let conn = self.conn.clone();
        if conn.is_in_transaction().unwrap_or(false) {
            tracing::warn!(connection = conn.id(), "pooled connection dropped inside a transaction, terminating");
            conn.terminate();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    if let Err(e) = pool.release(&conn).await {
                        tracing::debug!(connection = conn.id(), error = %e, "release on drop failed");
                    }
                });
            }
            Err(_) => {
                tracing::trace!(connection = conn.id(), "no runtime to release on, terminating");
                conn.terminate();
            }
        }
    }
}
