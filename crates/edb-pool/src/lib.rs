//! # edb-driver-pool
//!
//! Connection pool and client facade for the edb driver.
//!
//! The pool is a fixed arena of slots ("holders"), each owning at most one
//! live connection, plus a FIFO queue of free slots. Callers wait on the
//! queue in arrival order, so acquisition is fair.
//!
//! ## Features
//!
//! - FIFO acquisition with optional timeouts; abandoned waits take nothing
//! - Lazy reconnection of broken connections and of connections from an
//!   older generation ([`Pool::expire_connections`])
//! - Pool size suggested by the server unless pinned by the caller
//! - `on_connect`, `on_acquire` and `on_release` hooks
//! - Graceful close with a slow-close warning and optional timeout
//! - Retryable transactions ([`Client::transaction`]) and a
//!   [`blocking`] adapter
//!
//! ## Example
//!
//! ```rust,ignore
//! use edb_driver_pool::Client;
//!
//! let client = Client::builder()
//!     .dsn("edgedb://admin@localhost:5656/main")
//!     .connector(connector)
//!     .build()?;
//!
//! client
//!     .transaction_run(|tx| async move {
//!         tx.execute("INSERT Account { name := 'x' }").await?;
//!         Ok(())
//!     })
//!     .await?;
//! client.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
mod holder;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod retry;

pub use client::{Client, ClientBuilder};
pub use config::PoolConfig;
pub use error::PoolError;
pub use lifecycle::{ConnectionHook, Hooks};
pub use metrics::PoolMetrics;
pub use pool::{Pool, PoolBuilder, PooledConnection};
pub use retry::{Attempt, TransactionAttempts};

pub use edb_client::{
    ConnectArgs, Connection, IsolationLevel, Options, RetryOptions, Transaction,
    TransactionOptions, TransactionState,
};
