//! Lifecycle coordinator for an ephemeral ClickHouse instance.
//!
//! `EphemeralServer` drives launch, readiness and teardown, and hands out
//! per-test databases while the instance is ready. The state machine is:
//!
//! ```text
//! Uninitialized -> Starting -> Ready -> Stopped
//!                     |
//!                     v
//!                   Failed
//! ```
//!
//! A failed start releases everything it acquired before returning, so the
//! caller never has to clean up after an error.

use clickhousetest_core::{
    ConnectionOptions, DatabaseClient, DatabaseConnector, DatabaseNamer, Error,
    LaunchConfig, LifecycleState, OwnershipMode, Phase, RandomHexNamer, Result, StopOutcome,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::namespace::{self, IsolatedDatabase};
use crate::ports_impl::HttpConnector;
use crate::process::{Launched, OwnedProcess, Ownership, launch};
use crate::readiness::wait_ready;
use crate::teardown::first_failure;

/// A ready instance: how it is owned, where it listens, and the control
/// connection used to create databases.
struct Instance {
    ownership: Ownership,
    connection: ConnectionOptions,
    control: Arc<dyn DatabaseClient>,
}

enum Lifecycle {
    Uninitialized,
    Starting,
    Ready(Box<Instance>),
    Failed,
    Stopped,
}

impl Lifecycle {
    const fn state(&self) -> LifecycleState {
        match self {
            Self::Uninitialized => LifecycleState::Uninitialized,
            Self::Starting => LifecycleState::Starting,
            Self::Ready(_) => LifecycleState::Ready,
            Self::Failed => LifecycleState::Failed,
            Self::Stopped => LifecycleState::Stopped,
        }
    }
}

fn lock(state: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources acquired by `start`, released in reverse acquisition order
/// unless committed.
///
/// The control connection is the last acquisition and nothing fallible
/// follows it, so only the process (and with it the data directory) is
/// tracked here.
#[derive(Default)]
struct Rollback {
    process: Option<OwnedProcess>,
}

impl Rollback {
    fn register_process(&mut self, process: OwnedProcess) {
        self.process = Some(process);
    }

    fn process_mut(&mut self) -> Option<&mut OwnedProcess> {
        self.process.as_mut()
    }

    /// Keep everything that was acquired.
    fn commit(self) -> Option<OwnedProcess> {
        self.process
    }

    /// Release everything that was acquired. Failures are logged, never returned.
    async fn run(self, grace: Duration) {
        if let Some(mut process) = self.process {
            if let Err(e) = process.terminate(grace).await {
                warn!(pid = ?process.pid(), error = %e, "Rollback: failed to release server process");
            }
        }
    }
}

/// Marks the coordinator `Failed` if `start` is abandoned before finishing.
struct StartingGuard<'a> {
    state: &'a Mutex<Lifecycle>,
    armed: bool,
}

impl StartingGuard<'_> {
    fn finish(mut self, next: Lifecycle) {
        self.armed = false;
        *lock(self.state) = next;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(self.state) = Lifecycle::Failed;
        }
    }
}

/// An ephemeral ClickHouse instance, owned or attached.
pub struct EphemeralServer {
    config: LaunchConfig,
    connector: Arc<dyn DatabaseConnector>,
    namer: Arc<dyn DatabaseNamer>,
    cancel: CancellationToken,
    state: Mutex<Lifecycle>,
}

impl EphemeralServer {
    /// Coordinator using the HTTP client. Nothing is launched until [`start`](Self::start).
    pub fn new(config: LaunchConfig) -> Self {
        Self::with_connector(config, Arc::new(HttpConnector))
    }

    /// Coordinator using a caller-supplied client.
    pub fn with_connector(config: LaunchConfig, connector: Arc<dyn DatabaseConnector>) -> Self {
        Self {
            config,
            connector,
            namer: Arc::new(RandomHexNamer::default()),
            cancel: CancellationToken::new(),
            state: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    /// Replace the database name generator.
    #[must_use]
    pub fn with_namer(mut self, namer: Arc<dyn DatabaseNamer>) -> Self {
        self.namer = namer;
        self
    }

    /// Observe `cancel` during readiness and namespace operations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Create a coordinator with the HTTP client and start it.
    pub async fn launch(config: LaunchConfig) -> Result<Self> {
        let server = Self::new(config);
        server.start().await?;
        Ok(server)
    }

    /// Launch the instance and wait until it accepts connections.
    ///
    /// Valid only once, from `Uninitialized`. On failure everything acquired
    /// so far is released, the coordinator moves to `Failed`, and the error
    /// that caused the failure is returned.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, Lifecycle::Uninitialized) {
                return Err(Error::InvalidState {
                    operation: "start",
                    state: state.state(),
                });
            }
            *state = Lifecycle::Starting;
        }

        let guard = StartingGuard {
            state: &self.state,
            armed: true,
        };

        match self.bring_up().await {
            Ok(instance) => {
                info!(
                    mode = ?instance.ownership.mode(),
                    address = %instance.connection.address(),
                    "Server ready"
                );
                guard.finish(Lifecycle::Ready(Box::new(instance)));
                Ok(())
            }
            Err(e) => {
                warn!(phase = ?e.phase(), error = %e, "Server failed to start");
                guard.finish(Lifecycle::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<Instance> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                phase: Phase::Launch,
            });
        }

        let Launched {
            ownership,
            connection,
        } = launch(&self.config)?;

        let mut rollback = Rollback::default();
        if let Ownership::Owned(process) = ownership {
            rollback.register_process(process);
        }

        let ready = match rollback.process_mut() {
            Some(process) => {
                tokio::select! {
                    ready = wait_ready(
                        self.connector.as_ref(),
                        &connection,
                        &self.config.retry,
                        &self.cancel,
                    ) => ready,
                    status = process.child_mut().wait() => Err(early_exit(status)),
                }
            }
            None => {
                wait_ready(
                    self.connector.as_ref(),
                    &connection,
                    &self.config.retry,
                    &self.cancel,
                )
                .await
            }
        };

        let control = match ready {
            Ok(control) => control,
            Err(e) => {
                rollback.run(self.config.shutdown_grace).await;
                return Err(e);
            }
        };
        let ownership = rollback
            .commit()
            .map_or(Ownership::Attached, Ownership::Owned);

        Ok(Instance {
            ownership,
            connection,
            control,
        })
    }

    /// Tear the instance down.
    ///
    /// Owned instances are terminated and their data directory removed;
    /// attached instances are left running. The control connection is closed
    /// last in both cases. The coordinator ends in `Stopped` even when a step
    /// fails; the first failure is returned and later ones are logged.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let instance = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, Lifecycle::Stopped) {
                Lifecycle::Ready(instance) => instance,
                Lifecycle::Starting => {
                    *state = Lifecycle::Starting;
                    return Err(Error::InvalidState {
                        operation: "stop",
                        state: LifecycleState::Starting,
                    });
                }
                Lifecycle::Uninitialized | Lifecycle::Failed | Lifecycle::Stopped => {
                    return Ok(StopOutcome::NotRunning);
                }
            }
        };

        let Instance {
            ownership,
            connection,
            control,
        } = *instance;

        let released = match ownership {
            Ownership::Owned(mut process) => process.terminate(self.config.shutdown_grace).await,
            Ownership::Attached => {
                debug!(address = %connection.address(), "Leaving attached server running");
                Ok(())
            }
        };

        let closed = control.close().await.map_err(|source| Error::Connection {
            phase: Phase::Teardown,
            target: connection.address(),
            source,
        });

        first_failure(released, closed)?;
        info!(address = %connection.address(), "Server stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Create a fresh database and open a client scoped to it.
    pub async fn new_database(&self) -> Result<IsolatedDatabase> {
        let (control, connection) = self.ready_handles("create a database")?;
        namespace::new_isolated_database(
            control.as_ref(),
            self.connector.as_ref(),
            &connection,
            self.namer.as_ref(),
            self.config.collision_retries,
            &self.cancel,
        )
        .await
    }

    /// Create a fresh database and return its name without opening a client.
    pub async fn create_database(&self) -> Result<String> {
        let (control, _) = self.ready_handles("create a database")?;
        namespace::create_database(
            control.as_ref(),
            self.namer.as_ref(),
            self.config.collision_retries,
            &self.cancel,
        )
        .await
    }

    /// Open a client scoped to an existing database.
    pub async fn open_database(&self, name: &str) -> Result<IsolatedDatabase> {
        let (_, connection) = self.ready_handles("open a database")?;
        namespace::open_database(self.connector.as_ref(), &connection, name, &self.cancel).await
    }

    /// Clone what namespace operations need, releasing the lock before any await.
    fn ready_handles(
        &self,
        operation: &'static str,
    ) -> Result<(Arc<dyn DatabaseClient>, ConnectionOptions)> {
        match &*lock(&self.state) {
            Lifecycle::Ready(instance) => {
                Ok((Arc::clone(&instance.control), instance.connection.clone()))
            }
            other => Err(Error::InvalidState {
                operation,
                state: other.state(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.state).state()
    }

    /// Connection options of the ready instance, with the allocated port.
    pub fn connection_options(&self) -> Option<ConnectionOptions> {
        match &*lock(&self.state) {
            Lifecycle::Ready(instance) => Some(instance.connection.clone()),
            _ => None,
        }
    }

    /// Data directory of a ready owned instance.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.with_owned(|process| process.data_dir().map(PathBuf::from))
    }

    /// Process id of a ready owned instance.
    pub fn pid(&self) -> Option<u32> {
        self.with_owned(OwnedProcess::pid)
    }

    pub const fn ownership_mode(&self) -> OwnershipMode {
        self.config.mode
    }

    pub const fn config(&self) -> &LaunchConfig {
        &self.config
    }

    fn with_owned<T>(&self, f: impl FnOnce(&OwnedProcess) -> Option<T>) -> Option<T> {
        match &*lock(&self.state) {
            Lifecycle::Ready(instance) => match &instance.ownership {
                Ownership::Owned(process) => f(process),
                Ownership::Attached => None,
            },
            _ => None,
        }
    }
}

fn early_exit(status: std::io::Result<std::process::ExitStatus>) -> Error {
    match status {
        Ok(status) => Error::Process {
            phase: Phase::Readiness,
            what: "server exited before accepting connections".to_string(),
            source: std::io::Error::other(format!("process exited with {status}")),
        },
        Err(source) => Error::Process {
            phase: Phase::Readiness,
            what: "wait for server process".to_string(),
            source,
        },
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Ready(instance) = state {
            if let Ownership::Owned(process) = &instance.ownership {
                warn!(
                    pid = ?process.pid(),
                    dir = ?process.data_dir(),
                    "Server dropped without stop; killing process and removing data directory"
                );
            }
        }
    }
}

impl fmt::Debug for EphemeralServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralServer")
            .field("mode", &self.config.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickhousetest_core::testing::FakeConnector;
    use clickhousetest_core::{PortStrategy, RetryPolicy};
    use std::collections::HashSet;
    use std::path::Path;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(10))
    }

    /// Owned config running `sleep 30` in place of the server.
    fn sleep_config(root: &Path) -> LaunchConfig {
        LaunchConfig::owned()
            .with_binary_name("sleep")
            .with_server_args(["30"])
            .with_port_strategy(PortStrategy::Fixed)
            .with_temp_root(root)
            .with_retry(quick_retry(3))
            .with_shutdown_grace(Duration::from_secs(2))
    }

    fn server(config: LaunchConfig, fake: &FakeConnector) -> EphemeralServer {
        EphemeralServer::with_connector(config, Arc::new(fake.clone()))
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[cfg(unix)]
    fn process_exists(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_ok()
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_owned_start_stop_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new();
        let server = server(sleep_config(root.path()), &fake);

        server.start().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Ready);
        let dir = server.data_dir().unwrap();
        let pid = server.pid().unwrap();
        assert!(dir.exists());
        assert!(process_exists(pid));

        assert_eq!(server.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(!dir.exists());
        assert!(!process_exists(pid));
        assert!(is_empty_dir(root.path()));
        assert_eq!(fake.closed_clients(), 1);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_unreachable_server_times_out_and_rolls_back() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::unreachable();
        let server = server(sleep_config(root.path()), &fake);

        let err = server.start().await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert_eq!(err.phase(), Some(Phase::Readiness));
        assert_eq!(server.state(), LifecycleState::Failed);
        assert!(is_empty_dir(root.path()));
        assert_eq!(fake.connect_calls(), 3);

        assert_eq!(server.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_server_exiting_early_fails_fast() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::unreachable();
        let config = sleep_config(root.path())
            .with_binary_name("true")
            .with_retry(RetryPolicy::fixed(100, Duration::from_millis(50)));
        let server = server(config, &fake);

        let started = Instant::now();
        let err = server.start().await.unwrap_err();
        assert!(
            matches!(err, Error::Process { phase: Phase::Readiness, .. }),
            "unexpected error: {err}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_cancellation_during_readiness() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::unreachable();
        let cancel = CancellationToken::new();
        let config =
            sleep_config(root.path()).with_retry(RetryPolicy::fixed(100, Duration::from_secs(1)));
        let server = server(config, &fake).with_cancellation(cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = server.start().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(server.state(), LifecycleState::Failed);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let config = sleep_config(root.path())
            .with_binary_name("clickhouse-definitely-not-installed")
            .with_search_path(root.path().display().to_string());
        let server = server(config, &FakeConnector::new());

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::NotFound { phase: Phase::Launch, .. }));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let server = server(LaunchConfig::attached("127.0.0.1", 0), &FakeConnector::new());
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(server.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stop_twice_is_safe() {
        let root = tempfile::tempdir().unwrap();
        let server = server(sleep_config(root.path()), &FakeConnector::new());
        server.start().await.unwrap();

        assert_eq!(server.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(server.stop().await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_attached_stop_leaves_instance_alone() {
        let fake = FakeConnector::new();
        let server = server(LaunchConfig::attached("127.0.0.1", 18123), &fake);

        server.start().await.unwrap();
        assert_eq!(server.ownership_mode(), OwnershipMode::Attached);
        assert!(server.pid().is_none());
        assert!(server.data_dir().is_none());
        assert_eq!(server.connection_options().unwrap().port, 18123);

        assert_eq!(server.stop().await.unwrap(), StopOutcome::Stopped);
        assert_eq!(fake.closed_clients(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_reported_after_teardown() {
        let fake = FakeConnector::new().fail_close();
        let server = server(LaunchConfig::attached("127.0.0.1", 18123), &fake);
        server.start().await.unwrap();

        let err = server.stop().await.unwrap_err();
        assert!(matches!(err, Error::Connection { phase: Phase::Teardown, .. }));
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_missing_data_dir_is_filesystem_error_after_full_teardown() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new();
        let server = server(sleep_config(root.path()), &fake);
        server.start().await.unwrap();

        let dir = server.data_dir().unwrap();
        let pid = server.pid().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let err = assert_err!(server.stop().await);
        assert!(
            matches!(err, Error::Filesystem { phase: Phase::Teardown, .. }),
            "unexpected error: {err}"
        );
        assert!(!process_exists(pid));
        assert_eq!(fake.closed_clients(), 1);
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(assert_ok!(server.stop().await), StopOutcome::NotRunning);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_owned_close_failure_reported_only_when_teardown_succeeded() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeConnector::new().fail_close();
        let clean = server(sleep_config(root.path()), &fake);
        clean.start().await.unwrap();

        let err = assert_err!(clean.stop().await);
        assert!(matches!(err, Error::Connection { phase: Phase::Teardown, .. }));
        assert!(is_empty_dir(root.path()));

        // Directory removal fails too: that error outranks the close failure
        let fake = FakeConnector::new().fail_close();
        let broken = server(sleep_config(root.path()), &fake);
        broken.start().await.unwrap();
        std::fs::remove_dir_all(broken.data_dir().unwrap()).unwrap();

        let err = assert_err!(broken.stop().await);
        assert!(matches!(err, Error::Filesystem { phase: Phase::Teardown, .. }));
        assert_eq!(fake.closed_clients(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeouts_do_not_panic() {
        let mut config = LaunchConfig::attached("127.0.0.1", crate::process::allocate_port().unwrap())
            .with_retry(
                RetryPolicy::fixed(2, Duration::from_millis(10))
                    .with_jitter(Duration::from_millis(5))
                    .with_attempt_timeout(Some(Duration::MAX)),
            );
        config.connection.tunables.execution_timeout = Duration::MAX;
        config.connection.tunables.dial_timeout = Duration::from_millis(500);
        let server = EphemeralServer::new(config);

        let err = assert_err!(server.start().await);
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_rejected_create_is_query_error() {
        let fake = FakeConnector::new().reject_create_database();
        let server = server(LaunchConfig::attached("127.0.0.1", 18123), &fake);
        server.start().await.unwrap();

        let err = assert_err!(server.new_database().await);
        match err {
            Error::Query {
                phase: Phase::Namespace,
                source,
                ..
            } => {
                assert_eq!(source.server_code(), Some(497));
                assert!(!source.is_database_exists());
            }
            other => panic!("expected query error, got {other}"),
        }
        assert_eq!(server.state(), LifecycleState::Ready);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_rejected_outside_ready() {
        let server = server(LaunchConfig::attached("127.0.0.1", 18123), &FakeConnector::new());

        let err = server.new_database().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: LifecycleState::Uninitialized,
                ..
            }
        ));

        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: LifecycleState::Ready,
                ..
            }
        ));

        server.stop().await.unwrap();
        let err = server.create_database().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: LifecycleState::Stopped,
                ..
            }
        ));
        assert!(server.open_database("default").await.is_err());
    }

    #[tokio::test]
    async fn test_new_databases_are_distinct() {
        let fake = FakeConnector::new();
        let server = server(LaunchConfig::attached("127.0.0.1", 18123), &fake);
        server.start().await.unwrap();

        let mut names = HashSet::new();
        for _ in 0..10 {
            let db = server.new_database().await.unwrap();
            assert_eq!(db.name().len(), 8);
            assert_eq!(db.current_database().await.unwrap(), db.name());
            names.insert(db.name().to_string());
        }
        assert_eq!(names.len(), 10);
        assert!(names.iter().all(|name| fake.databases().contains(name)));

        let name = server.create_database().await.unwrap();
        let reopened = server.open_database(&name).await.unwrap();
        assert_eq!(reopened.name(), name);

        server.stop().await.unwrap();
    }
}
