//! Launch configuration and validation.
//!
//! `LaunchConfig` is an immutable value describing how to obtain an
//! instance: launch one (owned) or connect to one that already runs
//! (attached). It is built with `with_*` methods or overlaid from
//! `CLICKHOUSETEST_*` environment variables.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default ClickHouse HTTP interface port.
pub const DEFAULT_HTTP_PORT: u16 = 8123;

/// Default loopback host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Executable name searched for in owned mode.
pub const DEFAULT_BINARY_NAME: &str = "clickhouse";

/// Prefix of the per-instance temporary data directory.
pub const DEFAULT_TEMP_PREFIX: &str = "clickhousetest";

/// Argument the server binary is started with.
pub const DEFAULT_SERVER_ARG: &str = "server";

/// Environment variable that overrides binary resolution with an explicit path.
pub const SERVER_PATH_ENV: &str = "CLICKHOUSETEST_SERVER_PATH";

/// Whether this process launches the instance or attaches to a running one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipMode {
    /// Launch a private server; kill it and delete its directory on stop.
    #[default]
    Owned,
    /// Connect to an existing server; never kill it or touch its files.
    Attached,
}

/// How the owned server's listening ports are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStrategy {
    /// Allocate free loopback ports and pass them to the server as overrides.
    #[default]
    Allocate,
    /// Use the configured port as-is and pass no port arguments.
    Fixed,
}

/// Database, user and password for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Database the connection is scoped to.
    pub database: String,
    /// User name.
    pub username: String,
    /// Password (may be empty).
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            username: "default".to_string(),
            password: String::new(),
        }
    }
}

/// Per-connection tunables handed to the client collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionTunables {
    /// Server-side execution limit for a single statement.
    pub execution_timeout: Duration,
    /// Time allowed to establish a TCP connection.
    pub dial_timeout: Duration,
    /// Idle connections kept per host.
    pub max_idle_conns: usize,
    /// How long an idle connection may be reused.
    pub conn_max_lifetime: Duration,
}

impl Default for ConnectionTunables {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(2),
            max_idle_conns: 5,
            conn_max_lifetime: Duration::from_secs(600),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Host name or IP address.
    pub host: String,
    /// HTTP interface port.
    pub port: u16,
    /// Use HTTPS instead of HTTP.
    pub secure: bool,
    /// Database and credentials.
    pub auth: Credentials,
    /// Client tunables.
    pub tunables: ConnectionTunables,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
            secure: false,
            auth: Credentials::default(),
            tunables: ConnectionTunables::default(),
        }
    }
}

impl ConnectionOptions {
    /// `host:port` of the control plane.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the HTTP interface.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}/", self.address())
    }

    /// The same options scoped to another database.
    #[must_use]
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        let mut scoped = self.clone();
        scoped.auth.database = database.into();
        scoped
    }
}

/// Bounded retry budget for readiness polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of connect+ping attempts before giving up.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
    /// Maximum random deviation added to or removed from `interval`.
    pub jitter: Duration,
    /// Upper bound on a single attempt; `None` defers to the client's own timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            attempt_timeout: Some(Duration::from_secs(2)),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a fixed interval and no jitter.
    #[must_use]
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            ..Self::default()
        }
    }

    /// Set the jitter bound.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set (or clear) the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Delay to sleep after a failed attempt: `interval ± jitter`, never negative.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let offset = rand::thread_rng().gen_range(0..=jitter_ms.saturating_mul(2));
        self.interval
            .saturating_add(Duration::from_millis(offset))
            .saturating_sub(self.jitter)
    }

    /// Worst-case wall-clock time spent sleeping between attempts.
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        self.interval
            .saturating_add(self.jitter)
            .saturating_mul(self.attempts.saturating_sub(1))
    }
}

/// Launch configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Retry attempts must be at least 1")]
    ZeroAttempts,

    #[error("Server binary name cannot be empty")]
    EmptyBinaryName,

    #[error("Server arguments cannot be empty in owned mode")]
    EmptyServerArgs,

    #[error("Host cannot be empty")]
    EmptyHost,

    #[error("Database name cannot be empty")]
    EmptyDatabase,

    #[error("Port must be non-zero when it is not allocated, got {0}")]
    InvalidPort(u16),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
}

/// How to obtain an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Owned (launch) or attached (connect to existing).
    pub mode: OwnershipMode,
    /// Executable name looked up on the search path.
    pub binary_name: String,
    /// Explicit executable path; skips the search when set.
    pub server_path: Option<PathBuf>,
    /// PATH-style list of directories to search instead of `$PATH`.
    pub search_path: Option<String>,
    /// Prefix of the temporary data directory.
    pub temp_prefix: String,
    /// Parent directory of the data directory; the system temp dir when unset.
    pub temp_root: Option<PathBuf>,
    /// Arguments the server is started with.
    pub server_args: Vec<String>,
    /// How the owned server's ports are chosen.
    pub port_strategy: PortStrategy,
    /// Control-plane address and credentials.
    pub connection: ConnectionOptions,
    /// Readiness polling budget.
    pub retry: RetryPolicy,
    /// Extra attempts when a generated database name is already taken.
    pub collision_retries: u32,
    /// Time between SIGTERM and SIGKILL when stopping an owned server.
    pub shutdown_grace: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            mode: OwnershipMode::Owned,
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            server_path: None,
            search_path: None,
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            temp_root: None,
            server_args: vec![DEFAULT_SERVER_ARG.to_string()],
            port_strategy: PortStrategy::Allocate,
            connection: ConnectionOptions::default(),
            retry: RetryPolicy::default(),
            collision_retries: 3,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl LaunchConfig {
    /// Launch a private server on allocated ports.
    #[must_use]
    pub fn owned() -> Self {
        Self::default()
    }

    /// Attach to a server already listening at `host:port`.
    #[must_use]
    pub fn attached(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: OwnershipMode::Attached,
            port_strategy: PortStrategy::Fixed,
            connection: ConnectionOptions {
                host: host.into(),
                port,
                ..ConnectionOptions::default()
            },
            ..Self::default()
        }
    }

    /// Set the executable name searched for.
    #[must_use]
    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    /// Use an explicit executable path.
    #[must_use]
    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    /// Search these PATH-style directories instead of `$PATH`.
    #[must_use]
    pub fn with_search_path(mut self, paths: impl Into<String>) -> Self {
        self.search_path = Some(paths.into());
        self
    }

    /// Set the data directory prefix.
    #[must_use]
    pub fn with_temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    /// Create data directories under `root`.
    #[must_use]
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Replace the server arguments.
    #[must_use]
    pub fn with_server_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the port strategy.
    #[must_use]
    pub const fn with_port_strategy(mut self, strategy: PortStrategy) -> Self {
        self.port_strategy = strategy;
        self
    }

    /// Replace the connection options.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn with_credentials(mut self, auth: Credentials) -> Self {
        self.connection.auth = auth;
        self
    }

    /// Replace the readiness retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of retries on database-name collision.
    #[must_use]
    pub const fn with_collision_retries(mut self, retries: u32) -> Self {
        self.collision_retries = retries;
        self
    }

    /// Set the SIGTERM grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Whether this configuration launches its own server.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self.mode, OwnershipMode::Owned)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.connection.auth.database.trim().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }

        let port_is_allocated =
            self.is_owned() && matches!(self.port_strategy, PortStrategy::Allocate);
        if self.connection.port == 0 && !port_is_allocated {
            return Err(ConfigError::InvalidPort(0));
        }

        if self.is_owned() {
            if self.server_path.is_none() && self.binary_name.trim().is_empty() {
                return Err(ConfigError::EmptyBinaryName);
            }
            if self.server_args.is_empty() {
                return Err(ConfigError::EmptyServerArgs);
            }
        }

        Ok(())
    }

    /// Build a configuration from defaults overlaid with `CLICKHOUSETEST_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// Recognised keys: `CLICKHOUSETEST_MODE` (`owned`/`attached`),
    /// `_HOST`, `_PORT`, `_USER`, `_PASSWORD`, `_DATABASE`, `_SERVER_PATH`,
    /// `_RETRY_ATTEMPTS`, `_RETRY_INTERVAL_MS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("CLICKHOUSETEST_{suffix}");
            lookup(&var)
                .filter(|v| !v.trim().is_empty())
                .map(|v| (var, v))
        };

        let mut config = Self::default();

        if let Some((var, value)) = get("MODE") {
            config.mode = match value.trim().to_ascii_lowercase().as_str() {
                "owned" | "exec" => OwnershipMode::Owned,
                "attached" | "attach" => OwnershipMode::Attached,
                _ => return Err(ConfigError::InvalidValue { var, value }),
            };
            if !config.is_owned() {
                config.port_strategy = PortStrategy::Fixed;
            }
        }
        if let Some((_, host)) = get("HOST") {
            config.connection.host = host;
        }
        if let Some((var, value)) = get("PORT") {
            config.connection.port = parse_value(&var, &value)?;
            config.port_strategy = PortStrategy::Fixed;
        }
        if let Some((_, user)) = get("USER") {
            config.connection.auth.username = user;
        }
        if let Some((_, password)) = get("PASSWORD") {
            config.connection.auth.password = password;
        }
        if let Some((_, database)) = get("DATABASE") {
            config.connection.auth.database = database;
        }
        if let Some(path) = lookup(SERVER_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            config.server_path = Some(PathBuf::from(path));
        }
        if let Some((var, value)) = get("RETRY_ATTEMPTS") {
            config.retry.attempts = parse_value(&var, &value)?;
        }
        if let Some((var, value)) = get("RETRY_INTERVAL_MS") {
            config.retry.interval = Duration::from_millis(parse_value(&var, &value)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}
