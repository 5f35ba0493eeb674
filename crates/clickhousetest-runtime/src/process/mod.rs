//! Process management for owned instances.
//!
//! # Structure
//!
//! - `launcher` - Binary resolution, data directory, spawn, log forwarding
//! - `ports` - Ephemeral loopback port allocation
//! - `shutdown` - SIGTERM → SIGKILL termination with reaping

mod launcher;
mod ports;
pub mod shutdown;

pub use launcher::{Launched, OwnedProcess, Ownership, launch};
pub use ports::{allocate_port, allocate_ports, is_port_available};
pub use shutdown::shutdown_child;
