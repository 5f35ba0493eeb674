//! Database client port.
//!
//! The lifecycle manager never speaks the database protocol itself. It opens
//! connections, pings them, and runs statements through these two traits.
//! Implementations must be safe for concurrent use: the control connection
//! is shared by every concurrent `create_database` call.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConnectionOptions;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors reported by a database client collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request never reached the server or the connection broke.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected the statement.
    #[error("Server error{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Server {
        /// Server-side exception code, when reported.
        code: Option<u32>,
        /// Exception text returned by the server.
        message: String,
    },

    /// The server answered but the payload could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The connection was closed by the caller.
    #[error("Connection is closed")]
    Closed,
}

impl ClientError {
    /// ClickHouse exception code for `DATABASE_ALREADY_EXISTS`.
    pub const DATABASE_ALREADY_EXISTS: u32 = 82;

    /// Server exception code, if this is a server-side rejection.
    #[must_use]
    pub const fn server_code(&self) -> Option<u32> {
        match self {
            Self::Server { code, .. } => *code,
            _ => None,
        }
    }

    /// Whether the server refused to create a database because the name is taken.
    #[must_use]
    pub fn is_database_exists(&self) -> bool {
        self.server_code() == Some(Self::DATABASE_ALREADY_EXISTS)
    }
}

/// An open connection to one database inside an instance.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Liveness probe. Succeeds only if the target database is reachable.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<(), ClientError>;

    /// Run a query and return its rows.
    async fn query(&self, sql: &str) -> Result<Vec<Row>, ClientError>;

    /// Release the connection. Later calls fail with [`ClientError::Closed`].
    async fn close(&self) -> Result<(), ClientError>;
}

/// Opens [`DatabaseClient`]s from connection options.
///
/// Opening may be lazy; callers ping the returned client before trusting it.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Open a client for `options.database` at `options.address()`.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn DatabaseClient>, ClientError>;
}
