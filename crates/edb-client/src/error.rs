//! Client error types.

use std::time::Duration;

use edb_protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur during connection and transaction operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed connect arguments or option values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Misuse of the API.
    #[error("interface error: {0}")]
    Interface(String),

    /// Internal bookkeeping inconsistency.
    #[error("internal client error: {0}")]
    InternalClient(String),

    /// The connection was never established or has been terminated.
    #[error("connection closed")]
    ConnectionClosed,

    /// Establishing a connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An operation exceeded its time bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Connection(_) | Self::Timeout(_) => true,
            Self::Protocol(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Check if the connection that produced this error is no longer usable.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::Connection(_) => true,
            Self::Protocol(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Check if this error reports API misuse.
    #[must_use]
    pub fn is_interface_error(&self) -> bool {
        matches!(self, Self::Interface(_))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ConnectionClosed.is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(Error::Protocol(ProtocolError::ConnectionClosed).is_transient());
        assert!(
            !Error::Protocol(ProtocolError::Server {
                code: 1,
                message: "syntax".into(),
            })
            .is_transient()
        );
        assert!(!Error::Interface("misuse".into()).is_transient());
        assert!(!Error::Config("bad dsn".into()).is_transient());
    }

    #[test]
    fn test_timeout_is_not_a_connection_error() {
        assert!(!Error::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(Error::Connection("refused".into()).is_connection_error());
    }
}
