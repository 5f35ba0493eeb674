//! Core domain types, configuration and port definitions for `clickhousetest`.
//!
//! This crate has no process, filesystem or network code. It defines what an
//! ephemeral ClickHouse instance is configured with, which states its
//! lifecycle moves through, how failures are reported, and the traits the
//! runtime uses to talk to the database.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod ports;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{
    ConfigError, ConnectionOptions, ConnectionTunables, Credentials, LaunchConfig, OwnershipMode,
    PortStrategy, RetryPolicy,
};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleState, Phase, StopOutcome};
pub use ports::{
    ClientError, DatabaseClient, DatabaseConnector, DatabaseNamer, RandomHexNamer, Row,
    quote_identifier,
};
