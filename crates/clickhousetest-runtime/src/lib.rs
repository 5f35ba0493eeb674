//! Process, filesystem and network runtime for `clickhousetest`.
//!
//! [`EphemeralServer`] is the entry point: it launches (or attaches to) a
//! ClickHouse instance, waits for it to accept connections, hands out
//! per-test databases and tears everything down again.

#![deny(unsafe_code)]

pub mod binary;
pub mod namespace;
pub mod ports_impl;
pub mod process;
pub mod readiness;
mod server;
mod teardown;

// Re-export the coordinator
pub use server::EphemeralServer;

// Re-export namespace operations
pub use namespace::{IsolatedDatabase, create_database, new_isolated_database, open_database};

// Re-export the default client
pub use ports_impl::{HttpClient, HttpConnector};

// Re-export launch and readiness primitives for direct use if needed
pub use binary::resolve_server_binary;
pub use process::{Launched, OwnedProcess, Ownership, allocate_port, launch};
pub use readiness::wait_ready;
