//! Connection pool integration tests.
//!
//! These run against the in-memory connector from `edb-testing`; no server
//! is required.
//!
//! ```bash
//! cargo test -p edb-driver-pool --test pool
//! ```

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use edb_client::{BoxError, ConnectArgs, Connection};
use edb_driver_pool::{Client, ConnectionHook, Pool, PoolError};
use edb_testing::MockConnector;
use parking_lot::Mutex;

fn pool_with(connector: &MockConnector, concurrency: usize) -> Pool {
    Pool::builder()
        .connector(connector.clone())
        .concurrency(concurrency)
        .build()
        .unwrap()
}

/// Set `EDB_TEST_LOG=1` to see pool logs while debugging a test.
fn init_tracing() {
    if std::env::var_os("EDB_TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    }
}

/// Fail fast instead of waiting for the server to come up.
fn no_wait() -> ConnectArgs {
    ConnectArgs::new().wait_until_available(Duration::ZERO)
}

// =============================================================================
// Capacity and Fairness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_beyond_concurrency_suspends() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 2);

    let first = pool.acquire(None).await.unwrap();
    let _second = pool.acquire(None).await.unwrap();
    assert_eq!(pool.free_size(), 0);

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire(None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    pool.release(&first).await.unwrap();
    let third = waiter.await.unwrap().unwrap();
    assert!(third.same_as(&first));
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let held = pool.acquire(None).await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for name in ["a", "b", "c"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let con = pool.acquire(None).await.unwrap();
            order.lock().push(name);
            pool.release(&con).await.unwrap();
        }));
        // Let the task park on the queue before the next one arrives.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pool.release(&held).await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let _held = pool.acquire(None).await.unwrap();

    let err = pool
        .acquire(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout(d) if d == Duration::from_millis(200)));
    assert!(err.is_transient());
    assert_eq!(pool.metrics().failed_acquisitions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_wait_does_not_take_a_holder() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let held = pool.acquire(None).await.unwrap();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire(None).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    pool.release(&held).await.unwrap();
    assert_eq!(pool.free_size(), 1);
    let again = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    assert!(again.same_as(&held));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_requeues_holder() {
    let connector = MockConnector::builder()
        .with_connect_delay(Duration::from_secs(5))
        .build();
    let pool = pool_with(&connector, 1);

    let err = pool
        .acquire(Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout(_)));
    assert_eq!(pool.free_size(), 1);

    let con = pool.acquire(None).await.unwrap();
    assert!(!con.is_closed());
}

// =============================================================================
// Release
// =============================================================================

#[tokio::test]
async fn test_release_twice_is_noop() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();

    pool.release(&con).await.unwrap();
    pool.release(&con).await.unwrap();

    assert_eq!(pool.free_size(), 1);
    assert_eq!(pool.metrics().releases, 1);
    assert!(!con.is_closed());
}

#[tokio::test]
async fn test_release_foreign_connection_is_interface_error() {
    let connector = MockConnector::new();
    let ours = pool_with(&connector, 1);
    let theirs = pool_with(&connector, 1);
    let con = theirs.acquire(None).await.unwrap();

    let err = ours.release(&con).await.unwrap_err();
    assert!(matches!(err, PoolError::Interface(_)));
    assert!(err.to_string().contains("is not a member of this pool"));
    assert_eq!(theirs.free_size(), 0);
}

#[tokio::test]
async fn test_broken_connection_returns_holder_on_release() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();
    connector.sessions()[0].sever();

    pool.release(&con).await.unwrap();
    assert_eq!(pool.free_size(), 1);
    assert!(con.holder_link().is_none());

    let fresh = pool.acquire(None).await.unwrap();
    assert!(!fresh.same_as(&con));
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_terminated_connection_returns_holder_without_release() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();

    con.terminate();
    assert_eq!(pool.free_size(), 1);

    // Released on close; an explicit release afterwards does nothing.
    pool.release(&con).await.unwrap();
    assert_eq!(pool.free_size(), 1);
    assert_eq!(pool.metrics().releases, 1);
}

#[tokio::test]
async fn test_ensure_connected_leaves_checked_out_holder_alone() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();
    connector.sessions()[0].sever();

    pool.ensure_connected().await.unwrap();
    assert_eq!(connector.connect_count(), 1);
    assert!(con.holder_link().is_some());

    pool.release(&con).await.unwrap();
    assert_eq!(pool.free_size(), 1);

    let fresh = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    assert!(!fresh.is_closed());
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_ensure_connected_reconnects_free_holder() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 2);
    let busy = pool.acquire(None).await.unwrap();
    let idle = pool.acquire(None).await.unwrap();
    pool.release(&idle).await.unwrap();
    for session in connector.sessions() {
        session.sever();
    }

    pool.ensure_connected().await.unwrap();
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(pool.free_size(), 1);
    assert!(busy.holder_link().is_some());

    pool.release(&busy).await.unwrap();
    assert_eq!(pool.free_size(), 2);
}

#[tokio::test]
async fn test_release_inside_transaction_terminates() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();
    con.privileged_execute("START TRANSACTION;").await.unwrap();

    pool.release(&con).await.unwrap();
    assert!(con.is_closed());
    assert!(connector.sessions()[0].was_aborted());
    assert_eq!(pool.free_size(), 1);
}

#[tokio::test]
async fn test_pooled_connection_guard() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);

    let guard = pool.get().await.unwrap();
    guard.execute("SELECT 1").await.unwrap();
    assert_eq!(pool.free_size(), 0);
    guard.release().await.unwrap();
    assert_eq!(pool.free_size(), 1);

    let guard = pool.get().await.unwrap();
    drop(guard);
    let con = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(connector.connect_count(), 1);
    assert!(!con.is_closed());
}

// =============================================================================
// Generations and Sizing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_expired_connections_reconnect_lazily() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 2);
    let a = pool.acquire(None).await.unwrap();
    let b = pool.acquire(None).await.unwrap();
    pool.release(&a).await.unwrap();
    pool.release(&b).await.unwrap();
    assert_eq!(connector.connect_count(), 2);

    pool.expire_connections();
    assert_eq!(pool.generation(), 1);
    assert_eq!(connector.connect_count(), 2);

    let c = pool.acquire(None).await.unwrap();
    assert!(!c.same_as(&a));
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(pool.metrics().expired_reconnects, 1);

    // The other holder keeps its old connection until next used.
    assert!(!b.is_closed());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(a.is_closed());
    assert!(connector.sessions()[0].was_closed_gracefully());
}

#[tokio::test]
async fn test_expired_connection_is_closed_on_release() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    let con = pool.acquire(None).await.unwrap();

    pool.expire_connections();
    pool.release(&con).await.unwrap();

    assert!(con.is_closed());
    assert!(connector.sessions()[0].was_closed_gracefully());
    assert_eq!(pool.free_size(), 1);

    let fresh = pool.acquire(None).await.unwrap();
    assert!(!fresh.same_as(&con));
    assert_eq!(pool.metrics().expired_reconnects, 0);
}

#[tokio::test]
async fn test_server_suggested_concurrency() {
    let connector = MockConnector::builder()
        .with_suggested_concurrency(7)
        .build();
    let pool = Pool::builder().connector(connector.clone()).build().unwrap();
    assert_eq!(pool.concurrency(), 1);
    assert_eq!(pool.free_size(), 1);

    pool.ensure_connected().await.unwrap();
    assert_eq!(pool.concurrency(), 7);
    assert_eq!(pool.free_size(), 7);
    assert_eq!(connector.connect_count(), 1);

    // Already connected: nothing to do.
    pool.ensure_connected().await.unwrap();
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_pinned_concurrency_ignores_suggestion() {
    let connector = MockConnector::builder()
        .with_suggested_concurrency(7)
        .build();
    let pool = pool_with(&connector, 3);

    pool.ensure_connected().await.unwrap();
    assert_eq!(pool.concurrency(), 3);
    assert_eq!(pool.free_size(), 3);
}

#[tokio::test]
async fn test_set_connect_args_resolves_again() {
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .connect_args(ConnectArgs::new().database("first"))
        .concurrency(2)
        .build()
        .unwrap();

    let old = pool.acquire(None).await.unwrap();
    let old_cache = pool.query_cache();
    assert_eq!(old.dbname(), "first");

    pool.set_connect_args(ConnectArgs::new().database("second"));
    assert!(!pool.query_cache().same_as(&old_cache));

    let new = pool.acquire(None).await.unwrap();
    assert_eq!(new.dbname(), "second");
    assert!(new.query_cache().same_as(&pool.query_cache()));
    // Live connections are left alone.
    assert!(!old.is_closed());
    assert_eq!(old.dbname(), "first");
}

// =============================================================================
// Hooks
// =============================================================================

fn counting_hook(counter: &Arc<AtomicUsize>) -> impl Fn(&Connection) -> Result<(), BoxError> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_: &Connection| -> Result<(), BoxError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_hooks_run_per_connection_and_per_checkout() {
    let connector = MockConnector::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let acquires = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(AtomicUsize::new(0));
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .on_connect(counting_hook(&connects))
        .on_acquire(counting_hook(&acquires))
        .on_release(counting_hook(&releases))
        .build()
        .unwrap();

    for _ in 0..3 {
        let con = pool.acquire(None).await.unwrap();
        pool.release(&con).await.unwrap();
    }

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(acquires.load(Ordering::SeqCst), 3);
    assert_eq!(releases.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_on_acquire_terminates_and_requeues() {
    let connector = MockConnector::new();
    let fail = Arc::new(AtomicUsize::new(1));
    let remaining = Arc::clone(&fail);
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .on_acquire(move |_: &Connection| -> Result<(), BoxError> {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                return Err("not today".into());
            }
            Ok(())
        })
        .build()
        .unwrap();

    let err = pool.acquire(None).await.unwrap_err();
    assert!(matches!(err, PoolError::Hook { hook: "on_acquire", .. }));
    assert_eq!(pool.free_size(), 1);
    assert!(connector.sessions()[0].was_aborted());

    let con = pool.acquire(None).await.unwrap();
    assert!(!con.is_closed());
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn test_failed_on_connect_keeps_capacity() {
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .on_connect(|_: &Connection| -> Result<(), BoxError> { Err("bad session".into()) })
        .build()
        .unwrap();

    let err = pool.acquire(None).await.unwrap_err();
    assert!(matches!(err, PoolError::Hook { hook: "on_connect", .. }));
    assert_eq!(pool.free_size(), 1);
    assert!(connector.sessions()[0].was_aborted());
}

struct SlowHook(Duration);

#[async_trait::async_trait]
impl ConnectionHook for SlowHook {
    async fn call(&self, _connection: &Connection) -> Result<(), BoxError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_during_on_connect_terminates_connection() {
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .on_connect(SlowHook(Duration::from_secs(1)))
        .build()
        .unwrap();

    let err = pool
        .acquire(Some(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout(_)));
    assert!(connector.sessions()[0].was_aborted());
    assert_eq!(connector.open_sessions(), 0);
    assert_eq!(pool.metrics().connections_closed, 1);
    assert_eq!(pool.free_size(), 1);
}

#[tokio::test]
async fn test_failed_on_release_terminates() {
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .on_release(|_: &Connection| -> Result<(), BoxError> { Err("dirty".into()) })
        .build()
        .unwrap();

    let con = pool.acquire(None).await.unwrap();
    let err = pool.release(&con).await.unwrap_err();
    assert!(matches!(err, PoolError::Hook { hook: "on_release", .. }));
    assert!(con.is_closed());
    assert_eq!(pool.free_size(), 1);
}

// =============================================================================
// Connect Failures
// =============================================================================

#[tokio::test]
async fn test_connect_failure_keeps_capacity() {
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .connect_args(no_wait())
        .concurrency(1)
        .build()
        .unwrap();
    connector.fail_next_connects(1);

    let err = pool.acquire(None).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(pool.free_size(), 1);

    let con = pool.acquire(None).await.unwrap();
    assert!(!con.is_closed());
    assert_eq!(pool.metrics().connections_created, 1);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_close_waits_and_closes_gracefully() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 2);
    let con = pool.acquire(None).await.unwrap();

    let closer = tokio::spawn({
        let pool = pool.clone();
        async move { pool.close().await }
    });
    tokio::task::yield_now().await;
    assert!(pool.is_closing());
    assert!(matches!(pool.acquire(None).await, Err(PoolError::PoolClosing)));

    pool.release(&con).await.unwrap();
    closer.await.unwrap().unwrap();

    assert!(pool.is_closed());
    assert!(con.is_closed());
    assert!(connector.sessions()[0].was_closed_gracefully());
    assert!(matches!(pool.acquire(None).await, Err(PoolError::PoolClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_close_timeout_terminates() {
    init_tracing();
    let connector = MockConnector::new();
    let pool = Pool::builder()
        .connector(connector.clone())
        .concurrency(1)
        .close_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let con = pool.acquire(None).await.unwrap();

    let err = pool.close().await.unwrap_err();
    assert!(matches!(err, PoolError::CloseTimeout(_)));
    assert!(pool.is_closed());
    assert!(con.is_closed());
    assert!(connector.sessions()[0].was_aborted());

    let err = con.execute("SELECT 1").await.unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, 1);
    pool.close().await.unwrap();
    pool.close().await.unwrap();
    pool.terminate();
    assert!(pool.is_closed());
}

// =============================================================================
// Load
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_hundred_workers_share_five_connections() {
    init_tracing();
    let connector = MockConnector::builder()
        .with_execute_delay(Duration::from_millis(5))
        .build();
    let client = Client::builder()
        .connector(connector.clone())
        .concurrency(5)
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.execute("SELECT 1").await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(client.free_size(), 5);
    assert_eq!(connector.connect_count(), 5);
    assert_eq!(connector.open_sessions(), 5);

    let metrics = client.metrics();
    assert_eq!(metrics.acquisitions, 100);
    assert_eq!(metrics.releases, 100);
    assert!((metrics.acquire_success_rate() - 1.0).abs() < f64::EPSILON);
}
