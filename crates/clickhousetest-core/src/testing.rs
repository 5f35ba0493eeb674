//! In-memory fakes of the database client ports.
//!
//! `FakeConnector` behaves like a tiny ClickHouse: it knows which databases
//! exist, rejects duplicate `CREATE DATABASE`, answers `currentDatabase()`,
//! and can be told to refuse pings to simulate a server that is still
//! starting. Cloning shares state, so a test can keep a handle after giving
//! one to the code under test.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::ConnectionOptions;
use crate::ports::{ClientError, DatabaseClient, DatabaseConnector, Row};

/// ClickHouse exception code for `UNKNOWN_DATABASE`.
const UNKNOWN_DATABASE: u32 = 81;

#[derive(Debug)]
struct FakeState {
    never_ready: AtomicBool,
    ping_failures: AtomicU32,
    reject_create: AtomicBool,
    fail_close: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    databases: Mutex<HashSet<String>>,
    statements: Mutex<Vec<String>>,
    connect_calls: AtomicUsize,
    closed_clients: AtomicUsize,
}

/// Fake connector sharing one simulated server between all its clients.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    /// A server that is ready immediately and has only the `default` database.
    #[must_use]
    pub fn new() -> Self {
        let mut databases = HashSet::new();
        databases.insert("default".to_string());
        Self {
            state: Arc::new(FakeState {
                never_ready: AtomicBool::new(false),
                ping_failures: AtomicU32::new(0),
                reject_create: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
                connect_delay: Mutex::new(None),
                databases: Mutex::new(databases),
                statements: Mutex::new(Vec::new()),
                connect_calls: AtomicUsize::new(0),
                closed_clients: AtomicUsize::new(0),
            }),
        }
    }

    /// A server that refuses every ping.
    #[must_use]
    pub fn unreachable() -> Self {
        let fake = Self::new();
        fake.state.never_ready.store(true, Ordering::SeqCst);
        fake
    }

    /// Refuse the next `n` pings, then answer normally.
    #[must_use]
    pub fn fail_pings(self, n: u32) -> Self {
        self.state.ping_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Delay every `connect` call, simulating a slow dial.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *lock(&self.state.connect_delay) = Some(delay);
        self
    }

    /// Pretend `name` already exists on the server.
    #[must_use]
    pub fn with_existing_database(self, name: impl Into<String>) -> Self {
        lock(&self.state.databases).insert(name.into());
        self
    }

    /// Reject every `CREATE DATABASE` with a non-collision server error.
    #[must_use]
    pub fn reject_create_database(self) -> Self {
        self.state.reject_create.store(true, Ordering::SeqCst);
        self
    }

    /// Make `close` fail on every client.
    #[must_use]
    pub fn fail_close(self) -> Self {
        self.state.fail_close.store(true, Ordering::SeqCst);
        self
    }

    /// Stop refusing pings.
    pub fn make_ready(&self) {
        self.state.never_ready.store(false, Ordering::SeqCst);
        self.state.ping_failures.store(0, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of clients that have been closed.
    pub fn closed_clients(&self) -> usize {
        self.state.closed_clients.load(Ordering::SeqCst)
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state.statements).clone()
    }

    /// Databases currently known to the fake server.
    pub fn databases(&self) -> HashSet<String> {
        lock(&self.state.databases).clone()
    }
}

#[async_trait]
impl DatabaseConnector for FakeConnector {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn DatabaseClient>, ClientError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(FakeClient {
            database: options.auth.database.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client handed out by [`FakeConnector`].
#[derive(Debug)]
pub struct FakeClient {
    database: String,
    state: Arc<FakeState>,
    closed: AtomicBool,
}

impl FakeClient {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseClient for FakeClient {
    async fn ping(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        if self.state.never_ready.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".to_string()));
        }
        let refused = self
            .state
            .ping_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::Transport("connection refused".to_string()));
        }
        if !lock(&self.state.databases).contains(&self.database) {
            return Err(ClientError::Server {
                code: Some(UNKNOWN_DATABASE),
                message: format!("Database {} does not exist", self.database),
            });
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        lock(&self.state.statements).push(sql.to_string());

        if let Some(name) = created_database(sql) {
            if self.state.reject_create.load(Ordering::SeqCst) {
                return Err(ClientError::Server {
                    code: Some(497),
                    message: "Not enough privileges".to_string(),
                });
            }
            let mut databases = lock(&self.state.databases);
            if !databases.insert(name.clone()) {
                return Err(ClientError::Server {
                    code: Some(ClientError::DATABASE_ALREADY_EXISTS),
                    message: format!("Database {name} already exists"),
                });
            }
        }
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, ClientError> {
        self.ensure_open()?;
        lock(&self.state.statements).push(sql.to_string());

        if sql.contains("currentDatabase()") {
            let mut row = Row::new();
            row.insert(
                "db_name".to_string(),
                serde_json::Value::String(self.database.clone()),
            );
            return Ok(vec![row]);
        }
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.state.closed_clients.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("close failed".to_string()));
        }
        Ok(())
    }
}

/// Extract the database name from a ``CREATE DATABASE `name` `` statement.
fn created_database(sql: &str) -> Option<String> {
    let rest = sql.trim().strip_prefix("CREATE DATABASE ")?;
    let name = rest.trim().trim_end_matches(';').trim();
    Some(name.trim_matches('`').to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_rejects_duplicate_database() {
        let fake = FakeConnector::new();
        let client = fake.connect(&ConnectionOptions::default()).await.unwrap();

        client.execute("CREATE DATABASE `abc`").await.unwrap();
        let err = client.execute("CREATE DATABASE `abc`").await.unwrap_err();
        assert!(err.is_database_exists());
        assert!(fake.databases().contains("abc"));
    }

    #[tokio::test]
    async fn test_fake_ping_failures_then_ready() {
        let fake = FakeConnector::new().fail_pings(2);
        let client = fake.connect(&ConnectionOptions::default()).await.unwrap();

        assert!(client.ping().await.is_err());
        assert!(client.ping().await.is_err());
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_unknown_database_ping_fails() {
        let fake = FakeConnector::new();
        let options = ConnectionOptions::default().with_database("missing");
        let client = fake.connect(&options).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert_eq!(err.server_code(), Some(81));
    }

    #[tokio::test]
    async fn test_fake_close_is_single_shot() {
        let fake = FakeConnector::new();
        let client = fake.connect(&ConnectionOptions::default()).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.close().await, Err(ClientError::Closed));
        assert_eq!(client.ping().await, Err(ClientError::Closed));
        assert_eq!(fake.closed_clients(), 1);
    }
}
