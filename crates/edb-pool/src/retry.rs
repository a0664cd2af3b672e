//! Retryable transaction attempts.
//!
//! [`TransactionAttempts`] is a lazy, restartable sequence. Every
//! [`next_attempt`](TransactionAttempts::next_attempt) acquires a fresh
//! connection and yields an [`Attempt`] holding a new [`Transaction`]. The
//! sequence continues only while the previous attempt failed with a
//! transient error and the retry options allow another attempt.

use std::future::Future;
use std::sync::Arc;

use edb_client::{RetryOptions, Transaction};
use parking_lot::Mutex;

use crate::client::Client;
use crate::error::PoolError;
use crate::pool::PooledConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Committed,
    Failed { retryable: bool },
}

/// Sequence of transaction attempts created by
/// [`Client::transaction`](crate::Client::transaction).
#[derive(Debug)]
pub struct TransactionAttempts {
    client: Client,
    attempt: u32,
    outcome: Arc<Mutex<Option<AttemptOutcome>>>,
}

impl TransactionAttempts {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            attempt: 0,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of attempts handed out so far.
    #[must_use]
    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    /// Whether the last attempt failed in a way that will be retried.
    #[must_use]
    pub fn will_retry(&self) -> bool {
        *self.outcome.lock() == Some(AttemptOutcome::Failed { retryable: true })
    }

    /// Produce the next attempt.
    ///
    /// Returns `None` once an attempt committed, failed permanently, or was
    /// dropped without running. Sleeps the configured backoff before a
    /// retry. Transient acquire failures count as failed attempts.
    pub async fn next_attempt(&mut self) -> Result<Option<Attempt>, PoolError> {
        let retry = self.client.options().retry.clone();
        loop {
            if self.attempt > 0 {
                let outcome = self.outcome.lock().take();
                if outcome != Some(AttemptOutcome::Failed { retryable: true }) {
                    return Ok(None);
                }
                let backoff = retry.backoff_for_attempt(self.attempt + 1);
                tracing::debug!(attempt = self.attempt + 1, ?backoff, "retrying transaction");
                tokio::time::sleep(backoff).await;
            }
            self.attempt += 1;

            match self.client.pool().get().await {
                Ok(conn) => {
                    let tx = Transaction::new(
                        conn.connection().clone(),
                        self.client.options().transaction,
                    );
                    return Ok(Some(Attempt {
                        conn,
                        tx,
                        number: self.attempt,
                        retry,
                        outcome: Arc::clone(&self.outcome),
                    }));
                }
                Err(e) if is_retryable(&retry, self.attempt, &e) => {
                    tracing::debug!(attempt = self.attempt, error = %e, "transaction acquire failed");
                    *self.outcome.lock() = Some(AttemptOutcome::Failed { retryable: true });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(retry: &RetryOptions, attempt: u32, error: &PoolError) -> bool {
    attempt < retry.attempts && error.is_transient()
}

/// One attempt of a retryable transaction.
#[derive(Debug)]
pub struct Attempt {
    conn: PooledConnection,
    tx: Transaction,
    number: u32,
    retry: RetryOptions,
    outcome: Arc<Mutex<Option<AttemptOutcome>>>,
}

impl Attempt {
    /// 1-based attempt number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The transaction of this attempt. Not started until
    /// [`run`](Self::run).
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Run `work` in this attempt's transaction.
    ///
    /// Commits on `Ok` and rolls back on `Err`, then returns the connection
    /// to the pool and records the outcome for the sequence.
    pub async fn run<F, Fut, T>(self, work: F) -> Result<T, PoolError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let result = self.tx.run(work).await;
        self.finish(result).await
    }

    /// Return the connection and record how the attempt ended.
    pub(crate) async fn finish<T>(self, result: Result<T, PoolError>) -> Result<T, PoolError> {
        let outcome = match &result {
            Ok(_) => AttemptOutcome::Committed,
            Err(e) => AttemptOutcome::Failed {
                retryable: is_retryable(&self.retry, self.number, e),
            },
        };

        if self.tx.is_active() || self.conn.is_in_transaction().unwrap_or(false) {
            // The server may still hold the transaction open.
            self.conn.terminate();
        }
        if let Err(e) = self.conn.release().await {
            tracing::debug!(attempt = self.number, error = %e, "releasing attempt connection failed");
        }

        if let AttemptOutcome::Failed { retryable } = outcome {
            tracing::debug!(attempt = self.number, retryable, "transaction attempt failed");
        }
        *self.outcome.lock() = Some(outcome);
        result
    }
}
