//! # edb-client
//!
//! Connections and the transaction state machine for the edb driver.
//!
//! This crate sits between the protocol boundary (`edb-protocol`) and the
//! connection pool (`edb-driver-pool`). It owns everything that concerns a
//! single session:
//!
//! - **Connect resolution**: [`ConnectArgs`] parses DSNs and explicit
//!   arguments into the parameters a connector needs
//! - **Connections**: [`Connection`] wraps one protocol session, fans out
//!   server log messages, and reports back to its pool slot when terminated
//! - **Transactions**: [`Transaction`] generates the control statements for
//!   top-level transactions and savepoint blocks and enforces their
//!   state machine
//! - **Options**: [`Options`] bundles the retry policy and transaction
//!   defaults a client applies
//!
//! ## Transaction lifecycle
//!
//! ```text
//! New -> Started (via start())
//! Started -> Committed (via commit())
//! Started -> RolledBack (via rollback())
//! any control statement failure -> Failed
//! ```
//!
//! Most applications use the pool crate's `Client` rather than this crate
//! directly.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod options;
pub mod transaction;

pub use config::ConnectArgs;
pub use connection::{BoxError, Connection, HolderLink, ListenerId, LogListener, ReleaseOnClose};
pub use error::{Error, Result};
pub use options::{Options, RetryOptions, TransactionOptions};
pub use transaction::{
    IsolationLevel, ManagedBlock, Transaction, TransactionState, start_statement,
};

pub use edb_protocol::{LogMessage, LogSeverity, ServerSettings, TlsSecurity};
