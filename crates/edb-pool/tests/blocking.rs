//! Blocking adapter tests. These run on plain threads, without `#[tokio::test]`.

#![allow(clippy::unwrap_used)]

use std::thread;

use edb_driver_pool::{ClientBuilder, PoolError, TransactionOptions, TransactionState, blocking};
use edb_testing::MockConnector;

fn client(connector: &MockConnector, concurrency: usize) -> blocking::Client {
    blocking::Client::new(
        ClientBuilder::new()
            .connector(connector.clone())
            .concurrency(concurrency),
    )
    .unwrap()
}

#[test]
fn test_blocking_execute_from_threads() {
    let connector = MockConnector::new();
    let client = client(&connector, 2);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.execute("SELECT 1"))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(client.free_size(), 2);
    assert!(connector.connect_count() <= 2);
    assert_eq!(client.metrics().acquisitions, 8);
}

#[test]
fn test_blocking_transaction_with_savepoint() {
    let connector = MockConnector::new();
    let client = client(&connector, 1);

    let savepoint = client
        .transaction_run(|tx| {
            tx.execute("INSERT Item")?;
            let nested = tx.nested(TransactionOptions::default());
            nested.run(|sp| {
                assert!(sp.is_nested());
                sp.execute("INSERT Item")
            })?;
            assert_eq!(nested.state(), TransactionState::Committed);
            Ok(nested.savepoint_name())
        })
        .unwrap()
        .unwrap();

    assert_eq!(
        connector.statements(),
        vec![
            "START TRANSACTION;".to_string(),
            format!("DECLARE SAVEPOINT {savepoint};"),
            format!("RELEASE SAVEPOINT {savepoint};"),
            "COMMIT;".to_string(),
        ]
    );
    assert_eq!(client.free_size(), 1);
}

#[test]
fn test_blocking_failed_work_rolls_back() {
    let connector = MockConnector::new();
    let client = client(&connector, 1);

    let err = client
        .transaction_run(|_tx| Err::<(), _>(PoolError::Interface("nope".into())))
        .unwrap_err();
    assert!(matches!(err, PoolError::Interface(_)));
    assert_eq!(connector.statements(), vec!["START TRANSACTION;", "ROLLBACK;"]);
}

#[test]
fn test_blocking_manual_finish_rejected_inside_block() {
    let connector = MockConnector::new();
    let client = client(&connector, 1);

    client
        .transaction_run(|tx| {
            let err = tx.commit().unwrap_err();
            assert!(err.to_string().contains("cannot manually commit"), "{err}");
            let err = tx.rollback().unwrap_err();
            assert!(err.to_string().contains("cannot manually rollback"), "{err}");
            assert!(tx.is_active());
            tx.execute("INSERT Item")
        })
        .unwrap();

    assert_eq!(connector.statements(), vec!["START TRANSACTION;", "COMMIT;"]);
    assert_eq!(client.free_size(), 1);
}

#[test]
fn test_blocking_block_cannot_be_reentered() {
    let connector = MockConnector::new();
    let client = client(&connector, 1);

    let err = client
        .transaction_run(|tx| tx.run(|_inner| Ok(())))
        .unwrap_err();
    assert!(matches!(err, PoolError::Client(_)));
    assert!(err.to_string().contains("already in a managed transaction block"), "{err}");
    assert_eq!(connector.statements(), vec!["START TRANSACTION;", "ROLLBACK;"]);
}

#[test]
fn test_blocking_suggested_concurrency_and_close() {
    let connector = MockConnector::builder()
        .with_suggested_concurrency(4)
        .build();
    let client = client_unpinned(&connector);

    assert_eq!(client.concurrency(), 1);
    client.ensure_connected().unwrap();
    assert_eq!(client.concurrency(), 4);

    client.close().unwrap();
    assert!(client.is_closed());
    assert_eq!(connector.open_sessions(), 0);
}

fn client_unpinned(connector: &MockConnector) -> blocking::Client {
    blocking::Client::new(ClientBuilder::new().connector(connector.clone())).unwrap()
}
