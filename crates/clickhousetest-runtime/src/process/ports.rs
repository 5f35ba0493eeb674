//! Port allocation for owned instances.

use clickhousetest_core::{Error, Phase, Result};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

/// Check if a loopback port is available by binding and immediately releasing it.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .and_then(|listener| listener.local_addr())
        .is_ok()
}

/// Ask the OS for an unused loopback TCP port.
///
/// Binds `127.0.0.1:0`, reads back the assigned port and drops the listener
/// before returning. Nothing reserves the port afterwards: another process
/// may take it before the server binds it. Callers should hand it to the
/// server without delay.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).map_err(
        |source| Error::Resource {
            phase: Phase::Launch,
            what: "bind ephemeral loopback port".to_string(),
            source,
        },
    )?;

    let port = listener
        .local_addr()
        .map_err(|source| Error::Resource {
            phase: Phase::Launch,
            what: "read ephemeral port".to_string(),
            source,
        })?
        .port();
    drop(listener);

    debug!(port = %port, "Allocated ephemeral port");
    Ok(port)
}

/// Allocate `count` distinct ports.
///
/// The listeners are held until every port is chosen, so the OS cannot hand
/// out the same port twice within one call.
pub fn allocate_ports(count: usize) -> Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).map_err(
            |source| Error::Resource {
                phase: Phase::Launch,
                what: "bind ephemeral loopback port".to_string(),
                source,
            },
        )?;
        listeners.push(listener);
    }

    let ports = listeners
        .iter()
        .map(|l| l.local_addr().map(|a| a.port()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|source| Error::Resource {
            phase: Phase::Launch,
            what: "read ephemeral port".to_string(),
            source,
        })?;

    debug!(ports = ?ports, "Allocated ephemeral ports");
    Ok(ports)
}
