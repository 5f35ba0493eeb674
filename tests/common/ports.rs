//! Test port constants.

#![allow(dead_code)]

/// Port used by attached-mode tests that never open a real connection.
pub const TEST_ATTACHED_PORT: u16 = 18123;

/// A loopback port with nothing listening on it.
pub fn unused_port() -> u16 {
    clickhousetest_runtime::allocate_port().expect("allocate test port")
}
