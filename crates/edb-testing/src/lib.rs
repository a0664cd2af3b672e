//! # edb-testing
//!
//! Test infrastructure for edb driver development.
//!
//! This crate provides an in-memory [`MockConnector`] that hands out
//! [`MockProtocol`] sessions, so pool and transaction behavior can be tested
//! without a running server.
//!
//! ## Features
//!
//! - Records every control statement in execution order
//! - Tracks open/closed/aborted sessions and connect counts
//! - Fault injection: failing connects, failing statements, severed sessions
//! - Configurable server settings (e.g. `suggested_pool_concurrency`)
//! - Configurable connect/execute/close latency for timeout tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use edb_testing::MockConnector;
//!
//! #[tokio::test]
//! async fn test_with_mock() {
//!     let connector = MockConnector::builder()
//!         .with_suggested_concurrency(4)
//!         .build();
//!
//!     // Hand `connector.clone()` to a pool, then inspect it:
//!     assert_eq!(connector.connect_count(), 0);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock;

pub use mock::{MockConnector, MockConnectorBuilder, MockProtocol};
