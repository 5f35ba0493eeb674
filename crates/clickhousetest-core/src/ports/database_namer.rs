//! Database name generation port.

use rand::RngCore;
use std::fmt::Write as _;

/// Default length of generated database names, in hex characters.
pub const DEFAULT_NAME_LENGTH: usize = 8;

/// Produces candidate names for per-test databases.
///
/// Implementations are shared across tasks, so they must not rely on
/// reseeding a global generator per call.
pub trait DatabaseNamer: Send + Sync {
    /// Return a fresh candidate name.
    fn next_name(&self) -> String;
}

/// Random lowercase-hex names drawn from the thread-local CSPRNG.
///
/// `rand::thread_rng` is seeded once per thread from the OS and is never
/// shared between threads, so concurrent callers cannot race on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomHexNamer {
    length: usize,
}

impl RandomHexNamer {
    /// Create a namer producing names of `length` hex characters.
    ///
    /// A zero length is bumped to one.
    #[must_use]
    pub const fn new(length: usize) -> Self {
        Self {
            length: if length == 0 { 1 } else { length },
        }
    }

    /// Length of the generated names.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }
}

impl Default for RandomHexNamer {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_LENGTH)
    }
}

impl DatabaseNamer for RandomHexNamer {
    fn next_name(&self) -> String {
        let mut bytes = vec![0u8; self.length.div_ceil(2)];
        rand::thread_rng().fill_bytes(&mut bytes);

        let mut name = String::with_capacity(bytes.len() * 2);
        for byte in &bytes {
            let _ = write!(name, "{byte:02x}");
        }
        name.truncate(self.length);
        name
    }
}

/// Quote an identifier for use in a ClickHouse statement.
///
/// Generated names may start with a digit, which is not a valid bare
/// identifier, so names are always emitted in backticks.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}
