//! Packet capture: reading frames from a file or an interface and decoding
//! them into [`CapturedPacket`]s.

pub mod packet;
pub mod scope;
pub mod source;

pub use packet::{CapturedPacket, LinkType, NetworkFlow, TcpMeta, TransportFlow};
pub use scope::{PortScope, Scope};
pub use source::{PacketSource, open};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open capture file {path}: {source}")]
    OpenFile {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid capture file: {0}")]
    File(#[from] pcap_file::PcapError),

    #[error("unsupported link type {0}")]
    UnsupportedLinkType(String),

    #[cfg(feature = "live")]
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("live capture on {0} requires the `live` feature")]
    LiveUnavailable(String),
}
