//! Free port allocation by linear probing

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Return the first port >= `start` with nothing listening on `host`.
///
/// Probe the address the port will actually be bound on: a listener on
/// 127.0.0.2 is invisible to a connect on 127.0.0.1. The port is not
/// reserved; another process may bind it before the caller does. At most
/// `max_attempts` ports are probed.
///
/// Blocks for up to 200 ms per port; async callers go through
/// `spawn_blocking`.
pub fn find_free_port(host: IpAddr, start: u16, max_attempts: u16) -> E2eResult<u16> {
    let mut port = start;
    for _ in 0..max_attempts {
        if !is_listening(host, port) {
            debug!("Port {}:{} is free", host, port);
            return Ok(port);
        }
        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(E2eError::PortsExhausted {
        start,
        attempts: max_attempts,
    })
}

/// True when a TCP connect to `host:port` succeeds
pub fn is_listening(host: IpAddr, port: u16) -> bool {
    let addr = SocketAddr::from((host, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}
