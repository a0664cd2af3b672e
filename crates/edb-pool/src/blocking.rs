//! Blocking adapter.
//!
//! [`Client`] drives the same pool engine from synchronous code. It owns a
//! small tokio runtime; every call blocks the current thread on it. Do not
//! call these methods from inside an async context.
//!
//! ```rust,ignore
//! use edb_driver_pool::{ClientBuilder, blocking};
//!
//! let client = blocking::Client::new(ClientBuilder::new().dsn("edgedb://localhost/main").connector(connector))?;
//! client.transaction_run(|tx| {
//!     tx.execute("INSERT Account")?;
//!     Ok(())
//! })?;
//! ```

use std::fmt;
use std::sync::Arc;

use edb_client::{RetryOptions, TransactionOptions, TransactionState};
use tokio::runtime::Runtime;

use crate::client::{self, ClientBuilder};
use crate::error::PoolError;
use crate::metrics::PoolMetrics;

/// A synchronous client sharing its pool with an async [`client::Client`].
#[derive(Clone)]
pub struct Client {
    inner: client::Client,
    runtime: Arc<Runtime>,
}

impl Client {
    /// Build a blocking client.
    pub fn new(builder: ClientBuilder) -> Result<Self, PoolError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("edb-blocking")
            .enable_all()
            .build()
            .map_err(|e| PoolError::Configuration(format!("failed to start runtime: {e}")))?;
        Ok(Self {
            inner: builder.build()?,
            runtime: Arc::new(runtime),
        })
    }

    /// The async client this adapter wraps.
    #[must_use]
    pub fn as_async(&self) -> &client::Client {
        &self.inner
    }

    /// Maximum number of connections in the pool.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency()
    }

    /// Number of connections available in the pool.
    #[must_use]
    pub fn free_size(&self) -> usize {
        self.inner.free_size()
    }

    /// Pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }

    /// Connect eagerly.
    pub fn ensure_connected(&self) -> Result<&Self, PoolError> {
        self.runtime.block_on(self.inner.ensure_connected())?;
        Ok(self)
    }

    /// Replace every connection lazily.
    pub fn expire_connections(&self) {
        self.inner.expire_connections();
    }

    /// Return a shallow clone with different retry options.
    #[must_use]
    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            inner: self.inner.with_retry_options(retry),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Return a shallow clone with different transaction options.
    #[must_use]
    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        Self {
            inner: self.inner.with_transaction_options(transaction),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Execute a query outside of an explicit transaction.
    pub fn execute(&self, query: &str) -> Result<(), PoolError> {
        self.runtime.block_on(self.inner.execute(query))
    }

    /// Run `work` in a transaction, retrying transient failures.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err`.
    pub fn transaction_run<F, T>(&self, mut work: F) -> Result<T, PoolError>
    where
        F: FnMut(&Transaction) -> Result<T, PoolError>,
    {
        let mut attempts = self.inner.transaction();
        let mut last_error = None;
        while let Some(attempt) = self.runtime.block_on(attempts.next_attempt())? {
            let tx = Transaction {
                inner: attempt.transaction().clone(),
                runtime: Arc::clone(&self.runtime),
            };
            let result = tx.run(&mut work);
            match self.runtime.block_on(attempt.finish(result)) {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| PoolError::Internal("transaction ended without an attempt".into())))
    }

    /// Close the pool gracefully.
    pub fn close(&self) -> Result<(), PoolError> {
        self.runtime.block_on(self.inner.close())
    }

    /// Terminate every connection.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    /// Whether the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("blocking::Client")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// A transaction driven from synchronous code.
#[derive(Clone)]
pub struct Transaction {
    inner: edb_client::Transaction,
    runtime: Arc<Runtime>,
}

impl Transaction {
    /// The async transaction this adapter wraps.
    #[must_use]
    pub fn as_async(&self) -> &edb_client::Transaction {
        &self.inner
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.state()
    }

    /// Whether the transaction is started and not yet finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Whether this is a savepoint block.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.inner.is_nested()
    }

    /// Savepoint identifier of a nested transaction.
    #[must_use]
    pub fn savepoint_name(&self) -> Option<String> {
        self.inner.savepoint_name()
    }

    /// Execute a query inside the transaction.
    pub fn execute(&self, query: &str) -> Result<(), PoolError> {
        Ok(self.runtime.block_on(self.inner.execute(query))?)
    }

    /// A new, not yet started transaction on the same connection.
    ///
    /// Started while this one is active it becomes a savepoint block that
    /// inherits the unset attributes.
    #[must_use]
    pub fn nested(&self, options: TransactionOptions) -> Self {
        Self {
            inner: edb_client::Transaction::new(self.inner.connection().clone(), options),
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Start the transaction or savepoint block.
    pub fn start(&self) -> Result<(), PoolError> {
        Ok(self.runtime.block_on(self.inner.start())?)
    }

    /// Commit, or release the savepoint.
    pub fn commit(&self) -> Result<(), PoolError> {
        Ok(self.runtime.block_on(self.inner.commit())?)
    }

    /// Roll back, or roll back to the savepoint.
    pub fn rollback(&self) -> Result<(), PoolError> {
        Ok(self.runtime.block_on(self.inner.rollback())?)
    }

    /// Start, run `work`, then commit on `Ok` or roll back on `Err`.
    ///
    /// Manual [`commit`](Self::commit) and [`rollback`](Self::rollback) are
    /// rejected while `work` runs, and so is entering `run` again. A failed
    /// rollback is logged and the error from `work` returned.
    pub fn run<F, T>(&self, work: F) -> Result<T, PoolError>
    where
        F: FnOnce(&Transaction) -> Result<T, PoolError>,
    {
        let block = self.inner.enter_managed()?;
        self.start()?;
        match work(self) {
            Ok(value) => {
                self.runtime.block_on(block.commit())?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.runtime.block_on(block.rollback()) {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction block failed");
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}
