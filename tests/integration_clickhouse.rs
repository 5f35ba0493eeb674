//! End-to-end tests against a real ClickHouse server.
//!
//! These need a `clickhouse` binary on `$PATH` (or
//! `CLICKHOUSETEST_SERVER_PATH`) and are ignored by default:
//!
//! ```sh
//! cargo test --test integration_clickhouse -- --ignored
//! ```

mod common;

use clickhousetest::{EphemeralServer, Error, LaunchConfig, RetryPolicy, StopOutcome};
use common::fixtures::{clickhouse_available, is_empty_dir};
use std::time::Duration;

fn owned_config(root: &std::path::Path) -> LaunchConfig {
    LaunchConfig::from_env()
        .unwrap_or_default()
        .with_temp_root(root)
        .with_retry(RetryPolicy::fixed(30, Duration::from_secs(1)))
}

#[tokio::test]
#[ignore = "requires a clickhouse binary"]
async fn test_owned_server_isolates_databases() -> anyhow::Result<()> {
    clickhousetest::init_test_tracing();
    if !clickhouse_available() {
        eprintln!("Skipping: clickhouse binary not found");
        return Ok(());
    }

    let root = tempfile::tempdir()?;
    let server = EphemeralServer::launch(owned_config(root.path())).await?;
    let dir = server.data_dir().expect("owned instance has a data directory");

    let first = server.new_database().await?;
    let second = server.new_database().await?;
    assert_ne!(first.name(), second.name());
    assert_eq!(first.name().len(), 8);
    assert_eq!(first.current_database().await?, first.name());

    first
        .execute("CREATE TABLE events (id UInt64) ENGINE = MergeTree ORDER BY id")
        .await?;
    first.execute("INSERT INTO events VALUES (1), (2), (3)").await?;
    let rows = first.query("SELECT count() AS n FROM events").await?;
    assert_eq!(rows[0]["n"], "3");

    // The table is invisible from the sibling database
    assert!(second.query("SELECT count() FROM events").await.is_err());

    assert_eq!(server.stop().await?, StopOutcome::Stopped);
    assert!(!dir.exists());
    assert!(is_empty_dir(root.path()));
    Ok(())
}

#[tokio::test]
#[ignore = "requires a clickhouse binary"]
async fn test_tiny_budget_times_out_without_leftovers() -> anyhow::Result<()> {
    if !clickhouse_available() {
        eprintln!("Skipping: clickhouse binary not found");
        return Ok(());
    }

    let root = tempfile::tempdir()?;
    let config = owned_config(root.path())
        .with_retry(RetryPolicy::fixed(1, Duration::from_millis(1)).with_attempt_timeout(Some(
            Duration::from_millis(1),
        )));

    let err = EphemeralServer::launch(config).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
    assert!(is_empty_dir(root.path()));
    Ok(())
}
