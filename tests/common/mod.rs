//! Common test utilities.
//!
//! This module provides shared test infrastructure: launch configurations
//! that stand a short-lived process in for the server, and helpers for
//! checking that nothing was left behind.

pub mod fixtures;
pub mod ports;
