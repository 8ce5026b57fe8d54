use std::fmt;

use serde::Serialize;

use crate::capture::packet::{NetworkFlow, TransportFlow};

/// Direction-independent identity of a TCP connection.
///
/// Built from the undirected hashes of the address pair and the port pair, so
/// both directions of a connection map to the same value. Distinct
/// connections can collide; that is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn from_flows(net: &NetworkFlow, transport: &TransportFlow) -> Self {
        ConnectionId(net.fast_hash() ^ transport.fast_hash())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
