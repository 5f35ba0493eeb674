//! # clickhousetest
//!
//! Ephemeral ClickHouse instances for tests, with a fresh database per test.
//!
//! This crate is a thin facade over the workspace crates:
//!
//! - `clickhousetest_core` - Configuration, errors, lifecycle states and client ports
//! - `clickhousetest_runtime` - Process launch, readiness, namespaces and teardown
//!
//! ```no_run
//! use clickhousetest::{EphemeralServer, LaunchConfig};
//!
//! # async fn demo() -> clickhousetest::Result<()> {
//! let server = EphemeralServer::launch(LaunchConfig::from_env()?).await?;
//! let db = server.new_database().await?;
//! db.execute("CREATE TABLE t (x UInt8) ENGINE = Memory").await.ok();
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Workspace Crate Re-exports
// =============================================================================

pub use clickhousetest_core::{
    ClientError, ConfigError, ConnectionOptions, ConnectionTunables, Credentials, DatabaseClient,
    DatabaseConnector, DatabaseNamer, Error, LaunchConfig, LifecycleState, OwnershipMode,
    PortStrategy, RandomHexNamer, Result, RetryPolicy, Row, StopOutcome, quote_identifier,
};
pub use clickhousetest_runtime::{EphemeralServer, HttpClient, HttpConnector, IsolatedDatabase};

pub use tokio_util::sync::CancellationToken;

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG` (default `info`). Safe to call from every
/// test; only the first call installs anything. Server output is logged at
/// debug level under the `clickhousetest::server` target.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Test tracing initialised");
    }
}
