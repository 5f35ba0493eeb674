//! Port definitions (trait abstractions) for external collaborators.
//!
//! Ports define the interfaces the lifecycle manager expects from
//! infrastructure it does not implement itself.
//!
//! # Design Rules
//!
//! - No HTTP or wire-protocol types in any signature
//! - Clients are `Send + Sync` and shared behind `Arc`
//! - Name generation is injectable so concurrent callers never share a seed

pub mod database_client;
pub mod database_namer;

pub use database_client::{ClientError, DatabaseClient, DatabaseConnector, Row};
pub use database_namer::{DatabaseNamer, RandomHexNamer, quote_identifier};

#[cfg(any(test, feature = "test-utils"))]
pub use database_client::MockDatabaseClient;
