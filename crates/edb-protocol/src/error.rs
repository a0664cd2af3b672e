//! Protocol error types.

use thiserror::Error;

/// Errors reported by a protocol session or a connector.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Establishing the session failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The session was closed or aborted.
    #[error("connection closed")]
    ConnectionClosed,

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected a statement.
    #[error("server error {code:#x}: {message}")]
    Server {
        /// Server error code.
        code: u32,
        /// Server error message.
        message: String,
    },

    /// A protocol round-trip did not finish in time.
    #[error("protocol operation timed out")]
    Timeout,

    /// Unexpected message or state.
    #[error("unexpected protocol state: {0}")]
    Unexpected(String),
}

impl ProtocolError {
    /// Check if this error means the session is no longer usable.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionClosed | Self::Io(_) | Self::Timeout
        )
    }
}
