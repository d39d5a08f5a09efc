//! Bounded RTP port pool, grounded on `media-core`'s relay `PortAllocator`:
//! a base/max range scanned round-robin from `next_port`, tracking
//! outstanding leases in a map so a release makes the port immediately
//! reusable.

use std::collections::HashMap;
use std::net::UdpSocket as StdUdpSocket;

use crate::error::{Result, RtpError};

/// Thread-safe handle; callers wrap this in their own `Mutex`/`RwLock` at the
/// granularity they need (the call engine holds one allocator per listening
/// address behind a `tokio::sync::Mutex`).
pub struct PortAllocator {
    bind_ip: std::net::IpAddr,
    base_port: u16,
    max_port: u16,
    next_port: u16,
    allocated: HashMap<u16, ()>,
}

impl PortAllocator {
    pub fn new(base_port: u16, max_port: u16) -> Self {
        Self::with_bind_ip([0, 0, 0, 0].into(), base_port, max_port)
    }

    pub fn with_bind_ip(bind_ip: std::net::IpAddr, base_port: u16, max_port: u16) -> Self {
        Self { bind_ip, base_port, max_port, next_port: base_port, allocated: HashMap::new() }
    }

    /// Reserve the next free port in range, binding a UDP socket on it to
    /// prove it is actually available before handing it out.
    pub fn allocate(&mut self) -> Result<(u16, StdUdpSocket)> {
        let span = self.max_port.saturating_sub(self.base_port).max(1);
        for _ in 0..=span {
            let candidate = self.next_port;
            self.next_port =
                if candidate >= self.max_port { self.base_port } else { candidate + 1 };

            if self.allocated.contains_key(&candidate) {
                continue;
            }
            if let Ok(socket) = StdUdpSocket::bind((self.bind_ip, candidate)) {
                self.allocated.insert(candidate, ());
                return Ok((candidate, socket));
            }
        }
        Err(RtpError::PortsExhausted { base: self.base_port, max: self.max_port })
    }

    pub fn release(&mut self, port: u16) {
        self.allocated.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ports_until_exhausted() {
        let mut allocator = PortAllocator::new(34000, 34002);
        let (p1, _s1) = allocator.allocate().unwrap();
        let (p2, _s2) = allocator.allocate().unwrap();
        let (p3, _s3) = allocator.allocate().unwrap();
        let ports = [p1, p2, p3];
        assert_eq!(ports.iter().collect::<std::collections::HashSet<_>>().len(), 3);

        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn released_port_is_reusable() {
        let mut allocator = PortAllocator::new(34010, 34010);
        let (port, socket) = allocator.allocate().unwrap();
        drop(socket);
        assert!(allocator.allocate().is_err());

        allocator.release(port);
        let (again, _socket) = allocator.allocate().unwrap();
        assert_eq!(again, port);
    }
}
