//! Pool counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Live counters, updated by holders and the pool.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    created_at: Instant,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    failed_acquisitions: AtomicU64,
    expired_reconnects: AtomicU64,
    releases: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            created_at: Instant::now(),
            connections_created: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            failed_acquisitions: AtomicU64::new(0),
            expired_reconnects: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub(crate) fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acquired(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acquire_failed(&self) {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expired_reconnect(&self) {
        self.expired_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            expired_reconnects: self.expired_reconnects.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        }
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetrics {
    /// Physical connections opened since pool start.
    pub connections_created: u64,
    /// Physical connections closed or terminated by the pool.
    pub connections_closed: u64,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Failed acquisitions (timeouts, hook failures, connect errors).
    pub failed_acquisitions: u64,
    /// Reconnects caused by [`Pool::expire_connections`](crate::Pool::expire_connections).
    pub expired_reconnects: u64,
    /// Connections handed back to the pool.
    pub releases: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Acquisition success rate (0.0 to 1.0).
    #[must_use]
    pub fn acquire_success_rate(&self) -> f64 {
        let total = self.acquisitions + self.failed_acquisitions;
        if total == 0 {
            return 1.0;
        }
        self.acquisitions as f64 / total as f64
    }
}
