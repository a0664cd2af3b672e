//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Default delay before a slow [`Pool::close`](crate::Pool::close) logs a
/// warning.
pub const DEFAULT_CLOSE_WARNING_AFTER: Duration = Duration::from_secs(60);

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of connections. `None` lets the server suggest a size after
    /// the first connection; until then the pool holds a single slot.
    pub concurrency: Option<usize>,

    /// Time to wait for a free connection. `None` waits forever.
    pub acquire_timeout: Option<Duration>,

    /// Time allowed for closing a connection on release. `None` waits
    /// forever.
    pub release_timeout: Option<Duration>,

    /// Time allowed for a graceful [`Pool::close`](crate::Pool::close).
    /// When it elapses the pool is terminated.
    pub close_timeout: Option<Duration>,

    /// Log a warning when a graceful close is still waiting after this long.
    pub close_warning_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            acquire_timeout: None,
            release_timeout: None,
            close_timeout: None,
            close_warning_after: DEFAULT_CLOSE_WARNING_AFTER,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the number of connections.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set the release timeout.
    #[must_use]
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = Some(timeout);
        self
    }

    /// Set the close timeout.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// Set the slow-close warning threshold.
    #[must_use]
    pub fn close_warning_after(mut self, after: Duration) -> Self {
        self.close_warning_after = after;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.concurrency == Some(0) {
            return Err(PoolError::Configuration(
                "concurrency is expected to be greater than zero".into(),
            ));
        }
        if self.acquire_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PoolError::Configuration(
                "acquire_timeout must be greater than zero".into(),
            ));
        }
        if self.close_warning_after.is_zero() {
            return Err(PoolError::Configuration(
                "close_warning_after must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
