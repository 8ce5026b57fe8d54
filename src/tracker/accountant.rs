use std::sync::Arc;

use tracing::{trace, warn};

use crate::capture::packet::CapturedPacket;
use crate::tracker::connection_id::ConnectionId;
use crate::tracker::registry::StreamRegistry;

/// Which way a packet's payload was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Server to client.
    Incoming(u32),
    /// Client to server.
    Outgoing(u32),
    /// Unknown connection, or only one direction seen so far.
    Ignored,
}

/// Per-packet payload accounting for established connections.
pub struct PacketAccountant {
    registry: Arc<StreamRegistry>,
}

impl PacketAccountant {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self { registry }
    }

    pub fn account_packet(&self, packet: &CapturedPacket) -> Attribution {
        let id = ConnectionId::from_flows(&packet.net, &packet.transport);
        let Some(bidi) = self.registry.get(id) else {
            return Attribution::Ignored;
        };
        let Some(inbound) = bidi.inbound() else {
            return Attribution::Ignored;
        };

        let bytes = packet.payload_len();
        let storage = self.registry.storage();
        // Ports as well as addresses, so loopback traffic splits correctly.
        let is_inbound = inbound.net == packet.net && inbound.transport == packet.transport;
        let (attribution, result) = if is_inbound {
            (Attribution::Incoming(bytes), storage.incoming_payload(id, bytes))
        } else {
            (Attribution::Outgoing(bytes), storage.outgoing_payload(id, bytes))
        };

        if let Err(e) = result {
            warn!(connection = %id, bytes, error = %e, "error storing packet size");
        }
        trace!(connection = %id, ?attribution, "packet accounted");
        attribution
    }
}
