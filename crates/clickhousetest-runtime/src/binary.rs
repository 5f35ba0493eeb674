//! Server binary resolution.
//!
//! Precedence:
//! 1. `LaunchConfig::server_path` (also filled from `CLICKHOUSETEST_SERVER_PATH`)
//! 2. `LaunchConfig::search_path`, searched for `binary_name`
//! 3. `$PATH`, searched for `binary_name`

use clickhousetest_core::{Error, LaunchConfig, Phase, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve the server executable for an owned launch.
///
/// Fails with [`Error::NotFound`] when no candidate exists or the candidate is
/// not executable. Has no side effects, so it runs before the data directory
/// is created.
pub fn resolve_server_binary(config: &LaunchConfig) -> Result<PathBuf> {
    if let Some(path) = &config.server_path {
        debug!(path = %path.display(), "Using explicit server path");
        return validate_binary(path, display_name(config, path));
    }

    let name = config.binary_name.as_str();
    let found = match &config.search_path {
        Some(paths) => {
            let cwd = std::env::current_dir().map_err(|e| not_found(name, e.to_string()))?;
            which::which_in(name, Some(paths), cwd)
        }
        None => which::which(name),
    }
    .map_err(|e| not_found(name, e.to_string()))?;

    debug!(name = %name, path = %found.display(), "Resolved server binary");
    Ok(found)
}

/// Validate that an explicit binary path exists and is executable.
fn validate_binary(path: &Path, name: String) -> Result<PathBuf> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        not_found(
            &name,
            format!("cannot access {}: {e}", path.display()),
        )
    })?;

    if !metadata.is_file() {
        return Err(not_found(&name, format!("{} is not a file", path.display())));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Any execute bit (owner, group, or other)
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(not_found(
                &name,
                format!("{} is not executable", path.display()),
            ));
        }
    }

    Ok(path.to_path_buf())
}

fn display_name(config: &LaunchConfig, path: &Path) -> String {
    if config.binary_name.is_empty() {
        path.display().to_string()
    } else {
        config.binary_name.clone()
    }
}

fn not_found(name: &str, reason: String) -> Error {
    Error::NotFound {
        phase: Phase::Launch,
        name: name.to_string(),
        reason,
    }
}
