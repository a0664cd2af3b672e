//! Retry and transaction options.
//!
//! [`Options`] is an immutable bundle layered onto a client. Overrides
//! produce a new bundle; the original is never mutated.

use std::time::Duration;

use crate::error::Error;
use crate::transaction::IsolationLevel;

/// Retry policy for transaction attempts.
///
/// An attempt is retried only when its error is transient
/// (see [`Error::is_transient`]).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Maximum number of attempts, including the first (default: 3).
    pub attempts: u32,
    /// Backoff before the second attempt (default: 100ms).
    pub initial_backoff: Duration,
    /// Upper bound on backoff between attempts (default: 10s).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Create retry options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts. Values below one are raised to one.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the initial backoff duration.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff duration.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Run every transaction exactly once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to sleep before attempt number `attempt` (1-based).
    ///
    /// The first attempt never waits.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt may follow attempt number `attempt` that
    /// failed with `error`.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        attempt < self.attempts && error.is_transient()
    }
}

/// Default attributes for transactions started by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Isolation level; `None` leaves it to the server.
    pub isolation: Option<IsolationLevel>,
    /// Read-only flag; `None` leaves it to the server.
    pub readonly: Option<bool>,
    /// Deferrable flag; `None` leaves it to the server.
    pub deferrable: Option<bool>,
}

impl TransactionOptions {
    /// Create options that leave every attribute unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Set the read-only flag.
    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    /// Set the deferrable flag.
    #[must_use]
    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }
}

/// Options bundle shared by shallow clones of a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    /// Retry policy.
    pub retry: RetryOptions,
    /// Transaction defaults.
    pub transaction: TransactionOptions,
}

impl Options {
    /// Create an options bundle with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with different retry options.
    #[must_use]
    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            retry,
            transaction: self.transaction,
        }
    }

    /// Return a copy with different transaction options.
    #[must_use]
    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        Self {
            retry: self.retry.clone(),
            transaction,
        }
    }
}
