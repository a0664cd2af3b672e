//! # edb-protocol
//!
//! Boundary between the session layer and the wire protocol.
//!
//! The session layer (connections, pooling, transactions) never encodes or
//! decodes messages itself. It talks to a live server session through the
//! [`Protocol`] trait and opens new sessions through a [`Connector`]. This
//! crate defines those traits together with the resolved connection
//! parameters, server-advertised settings, log messages, and the opaque
//! codec caches that are shared by every connection of a pool.
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic
//! and makes no assumptions about the async runtime. Concrete protocol
//! implementations (and the in-memory mocks in `edb-testing`) plug in from
//! the outside.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod error;
pub mod protocol;
pub mod types;

pub use cache::{CodecsRegistry, QueryCache, QueryCodecs, QueryCodecsCache};
pub use error::ProtocolError;
pub use protocol::{Connector, LogSink, Protocol};
pub use types::{
    Address, ClientConfiguration, LogMessage, LogSeverity, ResolvedConnectConfig, ServerSettings,
    TlsSecurity, SUGGESTED_POOL_CONCURRENCY,
};
