//! Decoded packets and their flow metadata.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// Source and destination address of a packet, in the direction it travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Source and destination TCP port of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

impl NetworkFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Hash of the undirected address pair: `a -> b` and `b -> a` agree.
    pub fn fast_hash(&self) -> u64 {
        undirected_hash(self.src, self.dst)
    }
}

impl TransportFlow {
    pub fn new(src: u16, dst: u16) -> Self {
        Self { src, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Hash of the undirected port pair.
    pub fn fast_hash(&self) -> u64 {
        undirected_hash(self.src, self.dst)
    }
}

// DefaultHasher::new() uses fixed keys, so hashes are stable across runs.
fn undirected_hash<T: Hash + Ord>(a: T, b: T) -> u64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = DefaultHasher::new();
    lo.hash(&mut hasher);
    hi.hash(&mut hasher);
    hasher.finish()
}

impl fmt::Display for NetworkFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

impl fmt::Display for TransportFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// TCP header fields the reassembler and the accountant need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpMeta {
    pub seq: u32,
    /// Header length in bytes (data offset * 4).
    pub header_len: u16,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// A captured TCP packet.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: SystemTime,
    pub net: NetworkFlow,
    pub transport: TransportFlow,
    /// Network header length in bytes.
    pub ip_header_len: u16,
    /// Length of the IP datagram as stated by its header.
    pub ip_total_len: u16,
    pub tcp: TcpMeta,
    /// Captured TCP payload. May be shorter than [`Self::payload_len`] when
    /// the capture was truncated by the snap length.
    pub payload: Bytes,
}

impl CapturedPacket {
    /// TCP payload length according to the headers.
    pub fn payload_len(&self) -> u32 {
        u32::from(
            self.ip_total_len
                .saturating_sub(self.ip_header_len)
                .saturating_sub(self.tcp.header_len),
        )
    }
}

/// Link layer framing of captured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 datagrams.
    Raw,
    /// BSD loopback: 4-byte address family header.
    Null,
}

/// Decodes one captured frame. Returns `None` for anything that is not TCP
/// over IPv4 or IPv6.
pub fn decode(data: &[u8], link: LinkType, timestamp: SystemTime) -> Option<CapturedPacket> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::Raw => SlicedPacket::from_ip(data).ok()?,
        LinkType::Null => SlicedPacket::from_ip(data.get(4..)?).ok()?,
    };

    let (net, ip_header_len, ip_total_len) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                NetworkFlow::new(
                    IpAddr::V4(header.source_addr()),
                    IpAddr::V4(header.destination_addr()),
                ),
                u16::from(header.ihl()) * 4,
                header.total_len(),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                NetworkFlow::new(
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                ),
                40,
                header.payload_length().saturating_add(40),
            )
        }
        _ => return None,
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    Some(CapturedPacket {
        timestamp,
        net,
        transport: TransportFlow::new(tcp.source_port(), tcp.destination_port()),
        ip_header_len,
        ip_total_len,
        tcp: TcpMeta {
            seq: tcp.sequence_number(),
            header_len: u16::from(tcp.data_offset()) * 4,
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload: Bytes::copy_from_slice(tcp.payload()),
    })
}

/// Converts a capture timestamp (seconds + microseconds) to wall-clock time.
pub fn timestamp_from_parts(secs: u64, micros: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}
