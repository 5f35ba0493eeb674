//! Instance launcher.
//!
//! Owned mode resolves the server binary, allocates ports, creates a private
//! data directory and spawns the server inside it. Attached mode does none of
//! this. Either way the launcher returns as soon as the process has been
//! spawned; waiting for it to accept connections is the readiness gate's job.

use clickhousetest_core::{
    ConnectionOptions, Error, LaunchConfig, OwnershipMode, Phase, PortStrategy, Result,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::ports::allocate_ports;
use super::shutdown::shutdown_child;
use crate::binary::resolve_server_binary;
use crate::teardown::first_failure;

/// Server settings that receive an allocated port, in allocation order.
/// The first entry is the HTTP interface the client talks to.
const PORT_SETTINGS: [&str; 5] = [
    "http_port",
    "tcp_port",
    "mysql_port",
    "postgresql_port",
    "interserver_http_port",
];

/// Whether this process owns the instance.
///
/// Launch and teardown match on this exhaustively, so an attached instance
/// can never be killed or have its files removed.
#[derive(Debug)]
pub enum Ownership {
    /// Launched here; must be killed and its directory removed.
    Owned(OwnedProcess),
    /// Launched elsewhere; left untouched.
    Attached,
}

impl Ownership {
    /// The ownership mode this variant corresponds to.
    pub const fn mode(&self) -> OwnershipMode {
        match self {
            Self::Owned(_) => OwnershipMode::Owned,
            Self::Attached => OwnershipMode::Attached,
        }
    }
}

/// A launched server process and its private data directory.
#[derive(Debug)]
pub struct OwnedProcess {
    child: Child,
    pid: Option<u32>,
    binary: PathBuf,
    data_dir: Option<TempDir>,
    data_dir_path: PathBuf,
}

impl OwnedProcess {
    /// OS process id, captured at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Executable the server was started from.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Data directory, or `None` once it has been removed.
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_ref().map(TempDir::path)
    }

    pub(crate) const fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Terminate the process, then remove the data directory.
    ///
    /// A process that has already exited counts as terminated. Both steps
    /// always run; if both fail, the process error is returned and the
    /// directory error is logged. Calling this again after success is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        let killed = shutdown_child(&mut self.child, grace)
            .await
            .map(|status| {
                debug!(pid = ?self.pid, status = ?status, "Server process exited");
            })
            .map_err(|source| Error::Process {
                phase: Phase::Teardown,
                what: format!("terminate {} (pid {:?})", self.binary.display(), self.pid),
                source,
            });

        let removed = self.remove_data_dir();

        first_failure(killed, removed)
    }

    fn remove_data_dir(&mut self) -> Result<()> {
        let Some(dir) = self.data_dir.take() else {
            return Ok(());
        };
        dir.close().map_err(|source| Error::Filesystem {
            phase: Phase::Teardown,
            path: self.data_dir_path.clone(),
            source,
        })?;
        debug!(path = %self.data_dir_path.display(), "Removed data directory");
        Ok(())
    }
}

/// Result of a launch: who owns the instance and where to reach it.
#[derive(Debug)]
pub struct Launched {
    pub ownership: Ownership,
    pub connection: ConnectionOptions,
}

/// Obtain an instance according to `config`.
///
/// In owned mode this resolves the binary first, so a missing executable
/// fails before any directory is created. A spawn failure removes the
/// directory before returning.
pub fn launch(config: &LaunchConfig) -> Result<Launched> {
    match config.mode {
        OwnershipMode::Attached => {
            debug!(address = %config.connection.address(), "Attaching to existing server");
            Ok(Launched {
                ownership: Ownership::Attached,
                connection: config.connection.clone(),
            })
        }
        OwnershipMode::Owned => launch_owned(config),
    }
}

fn launch_owned(config: &LaunchConfig) -> Result<Launched> {
    let binary = resolve_server_binary(config)?;

    let mut connection = config.connection.clone();
    let mut args = config.server_args.clone();
    if matches!(config.port_strategy, PortStrategy::Allocate) {
        let ports = allocate_ports(PORT_SETTINGS.len())?;
        args.push("--".to_string());
        for (setting, port) in PORT_SETTINGS.iter().zip(&ports) {
            args.push(format!("--{setting}={port}"));
        }
        connection.port = ports[0];
    }

    let data_dir = create_data_dir(config)?;
    let data_dir_path = data_dir.path().to_path_buf();
    debug!(dir = %data_dir_path.display(), "Created data directory");

    let mut child = match spawn_server(&binary, &args, &data_dir_path) {
        Ok(child) => child,
        Err(source) => {
            if let Err(e) = data_dir.close() {
                warn!(dir = %data_dir_path.display(), error = %e, "Failed to remove data directory after spawn failure");
            }
            return Err(Error::Process {
                phase: Phase::Launch,
                what: format!("spawn {}", binary.display()),
                source,
            });
        }
    };

    let pid = child.id();
    spawn_log_readers(&mut child, pid);
    info!(
        pid = ?pid,
        binary = %binary.display(),
        address = %connection.address(),
        dir = %data_dir_path.display(),
        "Started server process"
    );

    Ok(Launched {
        ownership: Ownership::Owned(OwnedProcess {
            child,
            pid,
            binary,
            data_dir: Some(data_dir),
            data_dir_path,
        }),
        connection,
    })
}

fn create_data_dir(config: &LaunchConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(&config.temp_prefix);
    let created = match &config.temp_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    created.map_err(|source| Error::Resource {
        phase: Phase::Launch,
        what: "create data directory".to_string(),
        source,
    })
}

fn spawn_server(binary: &Path, args: &[String], dir: &Path) -> std::io::Result<Child> {
    Command::new(binary)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Drain the server's stdout and stderr into `tracing` so the pipes never fill.
fn spawn_log_readers(child: &mut Child, pid: Option<u32>) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, pid, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, pid, "stderr"));
    }
}

async fn forward_lines<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "clickhousetest::server", pid = ?pid, stream = name, "{line}");
    }
    debug!(pid = ?pid, stream = name, "Log reader task exiting");
}
