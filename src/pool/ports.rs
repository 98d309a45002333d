//! Local port allocation for pool-issued servers

use std::net::TcpListener;

use tracing::debug;

use crate::error::{JobProxyError, Result};

/// Hands out local ports from an inclusive range
///
/// Scans forward from the port after the last allocation, wrapping to the
/// start of the range once. A port counts as free when binding
/// `127.0.0.1:<port>` succeeds; the bound listener is returned so the caller
/// keeps the port reserved.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    cursor: u32,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            cursor: u32::from(start),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn allocate(&mut self) -> Result<(u16, TcpListener)> {
        let start = u32::from(self.start);
        let end = u32::from(self.end);
        let cursor = self.cursor.clamp(start, end + 1);

        for port in (cursor..=end).chain(start..cursor) {
            // The range is validated to fit in u16.
            let Ok(port) = u16::try_from(port) else {
                continue;
            };
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => {
                    self.cursor = u32::from(port) + 1;
                    return Ok((port, listener));
                }
                Err(e) => debug!(port, "Port unavailable: {}", e),
            }
        }

        Err(JobProxyError::NoAvailablePorts {
            start: self.start,
            end: self.end,
        })
    }
}
