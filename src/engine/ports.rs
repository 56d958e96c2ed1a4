use thiserror::Error;

/// Highest script port the allocator will hand out.
const MAX_PORT: u16 = 65_000;

/// A full sweep of the port range found nothing free. Callers back off
/// briefly and ask again.
#[derive(Debug, Error)]
#[error("no free script port in {start}..={MAX_PORT}")]
pub struct PortsExhausted {
    start: u16,
}

/// Hands out local TCP ports that are currently free, for use as emulator
/// script ports. Candidates walk `(start_port, 65000]` and wrap; each one
/// is probed by binding and immediately releasing a listener.
#[derive(Debug)]
pub struct PortAllocator {
    start_port: u16,
    cursor: parking_lot::Mutex<u16>,
}

impl PortAllocator {
    pub fn new(start_port: u16) -> Self {
        let start_port = start_port.min(MAX_PORT - 1);
        Self {
            start_port,
            cursor: parking_lot::Mutex::new(start_port),
        }
    }

    /// The next free port, or `PortsExhausted` after one full sweep.
    pub fn next(&self) -> Result<u16, PortsExhausted> {
        let mut cursor = self.cursor.lock();
        let sweep = u32::from(MAX_PORT - self.start_port);

        for _ in 0..sweep {
            let mut candidate = *cursor + 1;
            if candidate > MAX_PORT {
                candidate = self.start_port + 1;
            }
            *cursor = candidate;

            if port_is_free(candidate) {
                return Ok(candidate);
            }
        }

        Err(PortsExhausted {
            start: self.start_port + 1,
        })
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
