//! Connection pooling with metrics example.
//!
//! Runs a pool against the in-memory connector from `edb-testing`, so no
//! server is needed. Swap in a real [`Connector`](edb_protocol::Connector)
//! to talk to a database.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=debug cargo run --example connection_pool
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use edb_client::BoxError;
use edb_driver_pool::{Client, Connection, PoolError, RetryOptions, Transaction};
use edb_testing::MockConnector;
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let connector = MockConnector::builder()
        .with_suggested_concurrency(4)
        .with_connect_delay(Duration::from_millis(20))
        .with_execute_delay(Duration::from_millis(5))
        .build();

    println!("=== Connection Pool with Metrics Example ===\n");

    let client = Client::builder()
        .connector(connector.clone())
        .acquire_timeout(Duration::from_secs(5))
        .close_timeout(Duration::from_secs(10))
        .on_connect(|conn: &Connection| -> Result<(), BoxError> {
            println!("  connected: {}", conn.id());
            Ok(())
        })
        .build()?;

    // Example 1: the server suggests the pool size on first connect
    println!("1. Pool sizing:");
    println!("  before connect: {}", client.concurrency());
    client.ensure_connected().await?;
    println!("  after connect:  {}", client.concurrency());

    // Example 2: concurrent usage
    println!("\n2. Concurrent pool usage (20 parallel queries):");
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.execute("SELECT 1").await }));
    }
    for handle in handles {
        handle.await??;
    }
    println!("  completed in {:?}", start.elapsed());

    // Example 3: a transaction with a savepoint block
    println!("\n3. Transaction with savepoint:");
    client
        .transaction_run(|tx| async move {
            tx.execute("INSERT Account { name := 'a' }").await?;
            let nested = Transaction::new(
                tx.connection().clone(),
                Default::default(),
            );
            nested
                .run(|sp| async move { sp.execute("INSERT Account { name := 'b' }").await })
                .await?;
            Ok::<_, PoolError>(())
        })
        .await?;
    for statement in connector.statements() {
        println!("  {statement}");
    }

    // Example 4: retries are bounded by RetryOptions
    println!("\n4. Retry options:");
    let impatient = client.with_retry_options(
        RetryOptions::new()
            .attempts(2)
            .initial_backoff(Duration::from_millis(10)),
    );
    connector.set_broken(true);
    match impatient.execute("SELECT 1").await {
        Ok(()) => println!("  unexpected success"),
        Err(e) => println!("  gave up: {e} (transient: {})", e.is_transient()),
    }
    connector.set_broken(false);

    // Example 5: expire connections, they are replaced lazily
    println!("\n5. Expiring connections:");
    client.expire_connections();
    client.execute("SELECT 1").await?;
    println!("  generation: {}", client.pool().generation());

    print_metrics(&client);

    client.close().await?;
    println!("\nPool closed: {}", client.is_closed());
    Ok(())
}

fn print_metrics(client: &Client) {
    let metrics = client.metrics();
    println!("\n=== Pool Metrics ===");
    println!("  Connections created: {}", metrics.connections_created);
    println!("  Connections closed: {}", metrics.connections_closed);
    println!("  Acquisitions: {}", metrics.acquisitions);
    println!("  Failed acquisitions: {}", metrics.failed_acquisitions);
    println!("  Expired reconnects: {}", metrics.expired_reconnects);
    println!(
        "  Success rate: {:.1}%",
        metrics.acquire_success_rate() * 100.0
    );
    println!("  Uptime: {:?}", metrics.uptime);
    println!("  Free: {}/{}", client.free_size(), client.concurrency());
}
