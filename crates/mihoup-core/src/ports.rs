use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Connect timeout for a single probe. A firewalled or filtered port must
/// not stall the whole operation.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortsExhausted {
    pub starting_at: u16,
}

impl std::fmt::Display for PortsExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no free port found scanning upward from {}; free one manually",
            self.starting_at
        )
    }
}

impl std::error::Error for PortsExhausted {}

/// True when something on the local host already accepts TCP connections on
/// `port`.
pub fn is_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// First free port at or above `starting_at`.
///
/// The scan is a plain linear walk so identical inputs under identical port
/// occupancy always yield the same answer.
pub fn find_free(starting_at: u16) -> Result<u16, PortsExhausted> {
    let mut port = starting_at;
    loop {
        if !is_in_use(port) {
            return Ok(port);
        }
        port = match port.checked_add(1) {
            Some(next) => next,
            None => return Err(PortsExhausted { starting_at }),
        };
    }
}
