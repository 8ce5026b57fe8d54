//! Decides which packets take part in reassembly and accounting.

use crate::capture::packet::CapturedPacket;

pub trait Scope: Send + Sync {
    fn in_scope(&self, packet: &CapturedPacket) -> bool;
}

impl<F> Scope for F
where
    F: Fn(&CapturedPacket) -> bool + Send + Sync,
{
    fn in_scope(&self, packet: &CapturedPacket) -> bool {
        self(packet)
    }
}

/// Accepts packets whose source or destination port is one of `ports`.
#[derive(Debug, Clone)]
pub struct PortScope {
    ports: Vec<u16>,
}

impl PortScope {
    pub fn new(ports: impl Into<Vec<u16>>) -> Self {
        Self {
            ports: ports.into(),
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

impl Scope for PortScope {
    fn in_scope(&self, packet: &CapturedPacket) -> bool {
        self.ports.contains(&packet.transport.src) || self.ports.contains(&packet.transport.dst)
    }
}
