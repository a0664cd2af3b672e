//! Session capability traits.
//!
//! A [`Connector`] opens sessions; a [`Protocol`] is one open session.
//! Both use `#[async_trait]` because the session layer stores them as trait
//! objects.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::QueryCache;
use crate::error::ProtocolError;
use crate::types::{Address, ClientConfiguration, LogMessage, ResolvedConnectConfig, ServerSettings};

/// Receiver for server log messages of one session.
pub trait LogSink: Send + Sync {
    /// Called for every log message the server pushes.
    fn on_log_message(&self, message: LogMessage);
}

/// One live session with the server.
///
/// Implementations use interior mutability; every method takes `&self` so a
/// session can be shared between the connection that owns it and in-flight
/// operations.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Whether the session is closed or broken.
    fn is_closed(&self) -> bool;

    /// Whether the server reports an open transaction on this session.
    fn is_in_transaction(&self) -> bool;

    /// Settings advertised by the server.
    fn settings(&self) -> ServerSettings;

    /// Status tag of the last completed statement.
    fn last_status(&self) -> Option<Bytes>;

    /// Tear the session down immediately without a goodbye.
    fn abort(&self);

    /// Close the session gracefully.
    async fn close(&self) -> Result<(), ProtocolError>;

    /// Execute a transaction control statement, bypassing the query cache.
    async fn privileged_execute(&self, statement: &str) -> Result<(), ProtocolError>;

    /// Execute a query through the pool's codec caches.
    async fn execute(&self, query: &str, cache: &QueryCache) -> Result<(), ProtocolError>;
}

/// Factory for new sessions.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a session.
    ///
    /// Server log messages for the new session are delivered to `log_sink`.
    async fn connect(
        &self,
        address: &Address,
        config: &ClientConfiguration,
        params: &ResolvedConnectConfig,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Arc<dyn Protocol>, ProtocolError>;
}
