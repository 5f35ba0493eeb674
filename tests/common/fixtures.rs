//! Launch configurations and filesystem helpers.

#![allow(dead_code)]

use clickhousetest::{LaunchConfig, PortStrategy, RetryPolicy};
use std::path::Path;
use std::time::Duration;

/// Retry policy that gives up quickly.
pub fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::from_millis(20))
}

/// Owned config that runs `sleep 30` under `root` in place of the server.
pub fn sleep_config(root: &Path) -> LaunchConfig {
    LaunchConfig::owned()
        .with_binary_name("sleep")
        .with_server_args(["30"])
        .with_port_strategy(PortStrategy::Fixed)
        .with_temp_root(root)
        .with_retry(quick_retry(3))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// Whether `dir` has no entries.
pub fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Whether a real `clickhouse` binary can be found.
pub fn clickhouse_available() -> bool {
    clickhousetest_runtime::resolve_server_binary(&LaunchConfig::from_env().unwrap_or_default())
        .is_ok()
}
