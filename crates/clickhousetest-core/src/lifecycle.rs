//! Lifecycle states and startup phases.
//!
//! These are plain domain enums shared by the coordinator and the error
//! type, so that every failure can name the phase that produced it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of an ephemeral server coordinator.
///
/// ```text
/// Uninitialized -> Starting -> Ready -> Stopped
///                     |                   ^
///                     v                   |
///                   Failed ---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Created but `start` has not been called.
    Uninitialized,
    /// `start` is in progress (launch or readiness wait).
    Starting,
    /// The instance accepts connections and namespaces can be created.
    Ready,
    /// Startup failed; partial resources have already been rolled back.
    Failed,
    /// `stop` has run. Terminal.
    Stopped,
}

impl LifecycleState {
    /// Whether namespace operations are permitted in this state.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the coordinator can no longer reach `Ready`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Phase of the lifecycle an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Binary resolution, data directory creation, port allocation, spawn.
    Launch,
    /// Polling the instance until it answers a ping.
    Readiness,
    /// Creating or connecting to a per-test database.
    Namespace,
    /// Killing the process, removing the directory, closing the connection.
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Launch => "launch",
            Self::Readiness => "readiness",
            Self::Namespace => "namespace",
            Self::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Result of a `stop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A ready instance was torn down by this call.
    Stopped,
    /// Nothing was running (never started, failed, or already stopped).
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(LifecycleState::Ready.is_ready());
        assert!(!LifecycleState::Starting.is_ready());
        assert!(LifecycleState::Failed.is_terminal());
        assert!(LifecycleState::Stopped.is_terminal());
        assert!(!LifecycleState::Uninitialized.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(Phase::Readiness.to_string(), "readiness");
        assert_eq!(Phase::Teardown.to_string(), "teardown");
    }
}
