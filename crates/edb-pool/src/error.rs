//! Pool error types.

use std::time::Duration;

use edb_client::BoxError;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Failed to acquire a connection within the timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Pool is closing; no new connections are handed out.
    #[error("pool is closing")]
    PoolClosing,

    /// Graceful close did not finish in time; the pool was terminated.
    #[error("pool close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// Connection or transaction error.
    #[error(transparent)]
    Client(#[from] edb_client::Error),

    /// Misuse of the pool API.
    #[error("interface error: {0}")]
    Interface(String),

    /// Internal bookkeeping inconsistency.
    #[error("internal pool error: {0}")]
    Internal(String),

    /// A lifecycle hook failed.
    #[error("{hook} hook failed: {source}")]
    Hook {
        /// Which hook failed.
        hook: &'static str,
        /// The error the hook returned.
        #[source]
        source: BoxError,
    },

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AcquisitionTimeout(_) => true,
            Self::Client(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The client error, if this wraps one.
    #[must_use]
    pub fn as_client_error(&self) -> Option<&edb_client::Error> {
        match self {
            Self::Client(e) => Some(e),
            _ => None,
        }
    }
}
