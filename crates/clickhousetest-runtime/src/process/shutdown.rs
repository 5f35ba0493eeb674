//! Graceful shutdown for `tokio::process::Child` with SIGTERM → SIGKILL escalation.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use tokio::time::timeout;

/// Shut down a child process, escalating to SIGKILL after `grace`.
///
/// # Strategy
/// 1. If the child has already exited, reap it and return its status
/// 2. Send SIGTERM and wait up to `grace` for a clean exit
/// 3. If still running, send SIGKILL
/// 4. Wait for reaping (required to avoid zombies)
///
/// A child that is already gone is not an error: the exit status is returned.
///
/// # Platform behavior
/// - Unix: SIGTERM through `nix`, then SIGKILL via `Child::kill`
/// - Windows: `Child::kill` immediately (no graceful signal available)
pub async fn shutdown_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        debug!(status = ?status, "Child already exited");
        return Ok(status);
    }

    #[cfg(unix)]
    {
        shutdown_unix(child, grace).await
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        shutdown_windows(child).await
    }
}

#[cfg(unix)]
async fn shutdown_unix(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped by tokio
        return child.wait().await;
    };
    let raw_pid = i32::try_from(pid).map_err(io::Error::other)?;

    // Phase 1: SIGTERM with grace period
    if let Err(e) = signal::kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = timeout(grace, child.wait()).await {
        return result;
    }

    // Phase 2: SIGKILL (via Child::kill which uses SIGKILL on Unix)
    debug!(pid = %pid, grace = ?grace, "Child ignored SIGTERM, sending SIGKILL");
    match child.kill().await {
        Ok(()) => {}
        // Exited between the timeout and the kill
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }

    // Phase 3: Wait for reaping
    child.wait().await
}

#[cfg(not(unix))]
async fn shutdown_windows(child: &mut Child) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}
