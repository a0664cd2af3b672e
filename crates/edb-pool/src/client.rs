//! The client facade.
//!
//! A [`Client`] binds one [`Pool`] to an [`Options`] bundle. Overriding
//! options yields a shallow clone that shares the pool, so closing any clone
//! closes the pool for all of them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use edb_client::{ConnectArgs, Options, RetryOptions, Transaction, TransactionOptions};
use edb_protocol::Connector;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::ConnectionHook;
use crate::metrics::PoolMetrics;
use crate::pool::{Pool, PoolBuilder};
use crate::retry::TransactionAttempts;

/// A pooled database client.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
    options: Arc<Options>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Wrap an existing pool with default options.
    #[must_use]
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            options: Arc::new(Options::default()),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Options applied by this client.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Maximum number of connections in the pool.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.pool.concurrency()
    }

    /// Number of connections available in the pool.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.pool.free_size()
    }

    /// Pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Connect eagerly so that [`concurrency`](Self::concurrency) reflects
    /// the server suggestion.
    pub async fn ensure_connected(&self) -> Result<&Self, PoolError> {
        self.pool.ensure_connected().await?;
        Ok(self)
    }

    /// Replace every connection lazily.
    pub fn expire_connections(&self) {
        self.pool.expire_connections();
    }

    /// Return a shallow clone with different retry options.
    #[must_use]
    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            pool: self.pool.clone(),
            options: Arc::new(self.options.with_retry_options(retry)),
        }
    }

    /// Return a shallow clone with different transaction options.
    #[must_use]
    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        Self {
            pool: self.pool.clone(),
            options: Arc::new(self.options.with_transaction_options(transaction)),
        }
    }

    /// Execute a query outside of an explicit transaction.
    ///
    /// Transient failures are retried according to the retry options.
    pub async fn execute(&self, query: &str) -> Result<(), PoolError> {
        let retry = &self.options.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.execute_once(query).await;
            match result {
                Err(e) if attempt < retry.attempts && e.is_transient() => {
                    let backoff = retry.backoff_for_attempt(attempt + 1);
                    tracing::debug!(attempt, error = %e, ?backoff, "query failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn execute_once(&self, query: &str) -> Result<(), PoolError> {
        let conn = self.pool.get().await?;
        let result = conn.execute(query).await;
        conn.release().await?;
        result.map_err(PoolError::from)
    }

    /// Start a retryable transaction.
    ///
    /// ```rust,ignore
    /// let mut attempts = client.transaction();
    /// while let Some(attempt) = attempts.next_attempt().await? {
    ///     let result = attempt
    ///         .run(|tx| async move {
    ///             tx.execute("INSERT Account").await?;
    ///             Ok(())
    ///         })
    ///         .await;
    ///     if result.is_ok() || !attempts.will_retry() {
    ///         break;
    ///     }
    /// }
    /// ```
    #[must_use]
    pub fn transaction(&self) -> TransactionAttempts {
        TransactionAttempts::new(self.clone())
    }

    /// Run `work` in a transaction, retrying transient failures.
    ///
    /// Each attempt gets a fresh connection and a fresh [`Transaction`].
    pub async fn transaction_run<F, Fut, T>(&self, mut work: F) -> Result<T, PoolError>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let mut attempts = self.transaction();
        let mut last_error = None;
        while let Some(attempt) = attempts.next_attempt().await? {
            match attempt.run(&mut work).await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| PoolError::Internal("transaction ended without an attempt".into())))
    }

    /// Close the pool gracefully. See [`Pool::close`].
    pub async fn close(&self) -> Result<(), PoolError> {
        self.pool.close().await
    }

    /// Terminate every connection. See [`Pool::terminate`].
    pub fn terminate(&self) {
        self.pool.terminate();
    }

    /// Whether the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Builder for [`Client`].
#[derive(Debug, Default)]
#[must_use]
pub struct ClientBuilder {
    pool: PoolBuilder,
    options: Options,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connector used to open sessions.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.pool = self.pool.connector(connector);
        self
    }

    /// Set the connect arguments.
    pub fn connect_args(mut self, connect_args: ConnectArgs) -> Self {
        self.pool = self.pool.connect_args(connect_args);
        self
    }

    /// Connect using a DSN.
    pub fn dsn(self, dsn: impl Into<String>) -> Self {
        self.connect_args(ConnectArgs::from_dsn(dsn))
    }

    /// Replace the pool configuration.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = self.pool.config(config);
        self
    }

    /// Pin the number of connections.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.pool = self.pool.concurrency(concurrency);
        self
    }

    /// Set the default acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool = self.pool.acquire_timeout(timeout);
        self
    }

    /// Set the time allowed for a graceful close.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.pool = self.pool.close_timeout(timeout);
        self
    }

    /// Run `hook` once for every new physical connection.
    pub fn on_connect(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.pool = self.pool.on_connect(hook);
        self
    }

    /// Run `hook` every time a connection is handed out.
    pub fn on_acquire(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.pool = self.pool.on_acquire(hook);
        self
    }

    /// Run `hook` every time a connection is handed back.
    pub fn on_release(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.pool = self.pool.on_release(hook);
        self
    }

    /// Set the retry options.
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.options = self.options.with_retry_options(retry);
        self
    }

    /// Set the default transaction options.
    pub fn transaction_options(mut self, transaction: TransactionOptions) -> Self {
        self.options = self.options.with_transaction_options(transaction);
        self
    }

    /// Build the client. No connection is opened until first use.
    pub fn build(self) -> Result<Client, PoolError> {
        Ok(Client {
            pool: self.pool.build()?,
            options: Arc::new(self.options),
        })
    }
}
