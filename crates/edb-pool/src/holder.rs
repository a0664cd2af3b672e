//! Pool slots.
//!
//! A [`Holder`] owns zero or one live connection. Its state is derived from
//! `(connection, free)`:
//!
//! ```text
//! Empty -> Connecting -> Checked-out -> Free -> Checked-out -> ...
//! ```
//!
//! `free` is true exactly while the slot index sits in the pool's
//! [`HolderQueue`]. [`Holder::release_inner`] is the only place a slot is
//! pushed onto the queue, and it flips `free` atomically first, so a slot can
//! never be queued twice.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use edb_client::{Connection, HolderLink, ReleaseOnClose};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};

use crate::error::PoolError;
use crate::pool::PoolShared;

/// FIFO queue of free slot indexes.
///
/// Waiters are served in arrival order by the semaphore; a waiter that is
/// dropped before it is granted a permit takes nothing from the queue.
#[derive(Debug)]
pub(crate) struct HolderQueue {
    slots: Mutex<VecDeque<usize>>,
    permits: Semaphore,
}

impl HolderQueue {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
        }
    }

    pub(crate) fn push(&self, slot: usize) {
        self.slots.lock().push_back(slot);
        self.permits.add_permits(1);
    }

    /// Wait for a free slot. Fails once the queue is closed.
    pub(crate) async fn pop(&self) -> Result<usize, PoolError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::PoolClosed)?;
        permit.forget();
        self.slots
            .lock()
            .pop_front()
            .ok_or_else(|| PoolError::Internal("holder queue permit without a slot".into()))
    }

    /// Take a free slot if one is queued right now.
    pub(crate) fn try_pop(&self) -> Option<usize> {
        let permit = self.permits.try_acquire().ok()?;
        permit.forget();
        self.slots.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wake every waiter with [`PoolError::PoolClosed`].
    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

/// One pool slot.
#[derive(Debug)]
pub(crate) struct Holder {
    slot: usize,
    con: Mutex<Option<Connection>>,
    generation: AtomicU64,
    timeout: Mutex<Option<Duration>>,
    free: watch::Sender<bool>,
}

impl Holder {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            con: Mutex::new(None),
            generation: AtomicU64::new(0),
            timeout: Mutex::new(None),
            free: watch::Sender::new(true),
        }
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn is_free(&self) -> bool {
        *self.free.borrow()
    }

    /// Whether this slot currently holds a live connection.
    pub(crate) fn is_connected(&self) -> bool {
        self.con.lock().as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Whether `connection` is the one this slot holds.
    pub(crate) fn owns(&self, connection: &Connection) -> bool {
        self.con
            .lock()
            .as_ref()
            .is_some_and(|c| c.same_as(connection))
    }

    /// Mark the slot checked out. Called right after it leaves the queue.
    pub(crate) fn mark_checked_out(&self) {
        self.free.send_replace(false);
    }

    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    /// Remove the connection from the slot and unlink it.
    pub(crate) fn take_connection(&self) -> Option<Connection> {
        let con = self.con.lock().take();
        if let Some(con) = &con {
            con.detach_holder();
        }
        con
    }

    fn is_stale(&self, pool: &PoolShared) -> bool {
        self.generation.load(Ordering::Acquire) != pool.generation()
    }

    /// Open a new connection for this slot.
    pub(crate) async fn connect(&self, pool: &Arc<PoolShared>) -> Result<Connection, PoolError> {
        if self.con.lock().is_some() {
            return Err(PoolError::Internal(
                "holder.connect() called while another connection already exists".into(),
            ));
        }

        let con = pool.get_new_connection().await?;
        let weak: Weak<PoolShared> = Arc::downgrade(pool);
        let owner: Weak<dyn ReleaseOnClose> = weak;
        con.attach_holder(HolderLink::new(pool.id, self.slot, owner))?;
        let generation = pool.generation();
        self.generation.store(generation, Ordering::Release);
        *self.con.lock() = Some(con.clone());
        tracing::debug!(slot = self.slot, connection = con.id(), generation, "holder connected");
        Ok(con)
    }

    /// Prepare the slot's connection for a caller.
    ///
    /// Reconnects if the connection is missing, closed, or from an older
    /// generation. If the `on_acquire` hook fails the connection is
    /// terminated and the hook error returned; the caller re-queues the slot.
    pub(crate) async fn acquire(&self, pool: &Arc<PoolShared>) -> Result<Connection, PoolError> {
        let current = self.con.lock().clone();
        let con = match current {
            Some(con) if !con.is_closed() && self.is_stale(pool) => {
                tracing::debug!(slot = self.slot, connection = con.id(), "reconnecting expired holder");
                pool.metrics.expired_reconnect();
                self.discard(pool, false, None).await;
                self.connect(pool).await?
            }
            Some(con) if !con.is_closed() => con,
            _ => {
                if let Some(broken) = self.take_connection() {
                    broken.terminate();
                    pool.metrics.connection_closed();
                }
                self.connect(pool).await?
            }
        };

        if let Err(e) = pool.hooks.on_acquire(&con).await {
            if let Some(con) = self.take_connection() {
                con.terminate();
                pool.metrics.connection_closed();
            }
            return Err(e);
        }
        Ok(con)
    }

    /// Hand the slot back to the pool after use.
    pub(crate) async fn release(&self, pool: &Arc<PoolShared>) -> Result<(), PoolError> {
        if self.is_free() {
            return Err(PoolError::Internal(
                "holder.release() called on a free connection holder".into(),
            ));
        }

        let current = self.con.lock().clone();
        let Some(con) = current.filter(|c| !c.is_closed()) else {
            // Broken outside of an explicit close; a second call is a no-op.
            self.release_on_close(pool);
            return Ok(());
        };

        let timeout = self.timeout.lock().take();

        if con.is_in_transaction().unwrap_or(false) {
            tracing::debug!(slot = self.slot, connection = con.id(), "released inside a transaction, terminating");
            con.terminate();
            return Ok(());
        }

        if self.is_stale(pool) {
            self.close(pool, true, timeout).await;
            return Ok(());
        }

        if let Err(e) = pool.hooks.on_release(&con).await {
            // Terminating routes the slot back through release_on_close.
            con.terminate();
            return Err(e);
        }

        self.release_inner(pool);
        Ok(())
    }

    /// Close the slot's connection, then return the slot to the queue.
    ///
    /// With `wait == false` the close runs in the background.
    pub(crate) async fn close(&self, pool: &PoolShared, wait: bool, timeout: Option<Duration>) {
        self.discard(pool, wait, timeout).await;
        self.release_inner(pool);
    }

    async fn discard(&self, pool: &PoolShared, wait: bool, timeout: Option<Duration>) {
        let Some(con) = self.take_connection() else {
            return;
        };
        pool.metrics.connection_closed();
        if wait {
            if let Err(e) = con.close(timeout).await {
                tracing::debug!(slot = self.slot, error = %e, "connection close failed");
            }
        } else {
            let slot = self.slot;
            tokio::spawn(async move {
                if let Err(e) = con.close(timeout).await {
                    tracing::debug!(slot, error = %e, "background connection close failed");
                }
            });
        }
    }

    /// Terminate the slot's connection, if any.
    pub(crate) fn terminate(&self) {
        let con = self.con.lock().clone();
        if let Some(con) = con {
            con.terminate();
        }
    }

    /// Drop a connection that closed while checked out and free the slot.
    pub(crate) fn release_on_close(&self, pool: &PoolShared) {
        if let Some(con) = self.take_connection() {
            con.terminate();
            pool.metrics.connection_closed();
        }
        self.release_inner(pool);
    }

    /// Mark the slot free and push it onto the queue, once.
    pub(crate) fn release_inner(&self, pool: &PoolShared) {
        let newly_free = self.free.send_if_modified(|free| {
            if *free {
                false
            } else {
                *free = true;
                true
            }
        });
        if newly_free {
            tracing::trace!(slot = self.slot, "holder released");
            pool.metrics.released();
            pool.queue.push(self.slot);
        }
    }

    /// Wait until the slot is back in the queue.
    pub(crate) async fn wait_until_released(&self) {
        let mut rx = self.free.subscribe();
        // The sender lives as long as the holder.
        let _ = rx.wait_for(|free| *free).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let queue = HolderQueue::new();
        queue.push(2);
        queue.push(0);
        queue.push(1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await.ok(), Some(2));
        assert_eq!(queue.pop().await.ok(), Some(0));
        assert_eq!(queue.pop().await.ok(), Some(1));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_pop_takes_nothing() {
        let queue = HolderQueue::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        assert!(waited.is_err());

        queue.push(4);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await.ok(), Some(4));
    }

    #[test]
    fn test_try_pop_takes_only_queued_slots() {
        let queue = HolderQueue::new();
        assert_eq!(queue.try_pop(), None);
        queue.push(1);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_fails_waiters() {
        let queue = HolderQueue::new();
        queue.close();
        assert!(matches!(queue.pop().await, Err(PoolError::PoolClosed)));
    }

    #[test]
    fn test_new_holder_is_free_and_empty() {
        let holder = Holder::new(3);
        assert_eq!(holder.slot(), 3);
        assert!(holder.is_free());
        assert!(!holder.is_connected());
        holder.mark_checked_out();
        assert!(!holder.is_free());
    }
}
