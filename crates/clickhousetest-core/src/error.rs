//! Error type for lifecycle operations.
//!
//! Every variant carries the [`Phase`] it was raised in, so a caller seeing a
//! single error value can tell whether launch, readiness, namespace creation
//! or teardown failed.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::{LifecycleState, Phase};
use crate::ports::ClientError;

/// Errors returned by the ephemeral server lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The launch configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// The server executable could not be located.
    #[error("{phase}: server binary `{name}` not found: {reason}")]
    NotFound {
        phase: Phase,
        name: String,
        reason: String,
    },

    /// A temporary directory or port could not be obtained.
    #[error("{phase}: {what}: {source}")]
    Resource {
        phase: Phase,
        what: String,
        #[source]
        source: io::Error,
    },

    /// The server process could not be started or terminated.
    #[error("{phase}: {what}: {source}")]
    Process {
        phase: Phase,
        what: String,
        #[source]
        source: io::Error,
    },

    /// The readiness budget ran out without a successful ping.
    #[error(
        "{phase}: server at {address} not accepting connections after {attempts} attempts ({elapsed:?}){}",
        .last_error.as_ref().map(|e| format!("; last error: {e}")).unwrap_or_default()
    )]
    Timeout {
        phase: Phase,
        address: String,
        attempts: u32,
        elapsed: Duration,
        last_error: Option<ClientError>,
    },

    /// The caller's cancellation token fired.
    #[error("{phase}: cancelled")]
    Cancelled { phase: Phase },

    /// A connection could not be opened or failed its liveness probe.
    #[error("{phase}: connect to {target}: {source}")]
    Connection {
        phase: Phase,
        target: String,
        #[source]
        source: ClientError,
    },

    /// The instance rejected a statement.
    #[error("{phase}: statement `{statement}` failed: {source}")]
    Query {
        phase: Phase,
        statement: String,
        #[source]
        source: ClientError,
    },

    /// The operation is not valid in the coordinator's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// The data directory could not be removed.
    #[error("{phase}: remove {}: {source}", .path.display())]
    Filesystem {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Lifecycle phase the error was raised in, if it belongs to one.
    #[must_use]
    pub const fn phase(&self) -> Option<Phase> {
        match self {
            Self::Configuration(_) | Self::InvalidState { .. } => None,
            Self::NotFound { phase, .. }
            | Self::Resource { phase, .. }
            | Self::Process { phase, .. }
            | Self::Timeout { phase, .. }
            | Self::Cancelled { phase }
            | Self::Connection { phase, .. }
            | Self::Query { phase, .. }
            | Self::Filesystem { phase, .. } => Some(*phase),
        }
    }

    /// Whether this error came from the caller cancelling the operation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the readiness budget was exhausted.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for lifecycle operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
