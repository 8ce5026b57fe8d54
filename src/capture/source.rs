//! Capture sources: pcap file replay, and live interfaces with the `live`
//! feature.
//!
//! Both run on a blocking thread and hand decoded packets to the async side
//! through a bounded channel. The channel closing is the exhaustion signal.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pcap_file::DataLink;
use pcap_file::pcap::PcapReader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::CaptureError;
use crate::capture::packet::{CapturedPacket, LinkType, decode};
use crate::config::CaptureConfig;

const CHANNEL_CAPACITY: usize = 4096;

/// Stream of decoded packets produced by a capture thread.
pub struct PacketSource {
    packets: mpsc::Receiver<CapturedPacket>,
    stop: Arc<AtomicBool>,
}

impl PacketSource {
    /// Next packet, or `None` once the source is exhausted.
    pub async fn recv(&mut self) -> Option<CapturedPacket> {
        self.packets.recv().await
    }

    /// Wraps an existing channel. Used to drive the pipeline from memory.
    pub fn from_channel(packets: mpsc::Receiver<CapturedPacket>) -> Self {
        Self {
            packets,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the capture thread to stop at its next opportunity.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens the configured source. Everything that can fail before the first
/// packet (missing file, unknown link type, bad filter) fails here.
pub fn open(cfg: &CaptureConfig) -> Result<PacketSource, CaptureError> {
    match &cfg.input_file {
        Some(path) => open_file(path),
        None => open_live(cfg),
    }
}

pub fn open_file(path: &Path) -> Result<PacketSource, CaptureError> {
    let file = File::open(path).map_err(|source| CaptureError::OpenFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = PcapReader::new(BufReader::new(file))?;
    let link = file_link_type(reader.header().datalink)?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let name = path.display().to_string();

    info!(file = %name, "replaying capture file");

    tokio::task::spawn_blocking(move || {
        let mut count: u64 = 0;
        while !stop_thread.load(Ordering::SeqCst) {
            let packet = match reader.next_packet() {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    warn!(file = %name, error = %e, "error reading capture file, stopping");
                    break;
                }
                None => break,
            };
            count += 1;

            let timestamp = std::time::UNIX_EPOCH + packet.timestamp;
            let Some(decoded) = decode(&packet.data, link, timestamp) else {
                continue;
            };
            if tx.blocking_send(decoded).is_err() {
                break;
            }
        }
        debug!(file = %name, frames = count, "capture file reader finished");
    });

    Ok(PacketSource { packets: rx, stop })
}

fn file_link_type(datalink: DataLink) -> Result<LinkType, CaptureError> {
    match datalink {
        DataLink::ETHERNET => Ok(LinkType::Ethernet),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Ok(LinkType::Raw),
        DataLink::NULL | DataLink::LOOP => Ok(LinkType::Null),
        other => Err(CaptureError::UnsupportedLinkType(format!("{other:?}"))),
    }
}

#[cfg(not(feature = "live"))]
fn open_live(cfg: &CaptureConfig) -> Result<PacketSource, CaptureError> {
    Err(CaptureError::LiveUnavailable(cfg.interface.clone()))
}

#[cfg(feature = "live")]
fn open_live(cfg: &CaptureConfig) -> Result<PacketSource, CaptureError> {
    use pcap::Capture;

    let mut cap = Capture::from_device(cfg.interface.as_str())?
        .promisc(true)
        .snaplen(cfg.snaplen)
        .timeout(100)
        .open()?;
    if let Some(filter) = &cfg.bpf_filter {
        cap.filter(filter, true)?;
    }

    let link = match cap.get_datalink().0 {
        1 => LinkType::Ethernet,
        0 | 108 => LinkType::Null,
        12 | 101 | 228 | 229 => LinkType::Raw,
        other => return Err(CaptureError::UnsupportedLinkType(other.to_string())),
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let iface = cfg.interface.clone();

    info!(interface = %iface, "starting live capture");

    tokio::task::spawn_blocking(move || {
        while !stop_thread.load(Ordering::SeqCst) && !tx.is_closed() {
            match cap.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    let timestamp = crate::capture::packet::timestamp_from_parts(
                        ts.tv_sec as u64,
                        ts.tv_usec as u32,
                    );
                    let Some(decoded) = decode(packet.data, link, timestamp) else {
                        continue;
                    };
                    if tx.blocking_send(decoded).is_err() {
                        break;
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => {
                    warn!(interface = %iface, error = %e, "capture failed, stopping");
                    break;
                }
            }
        }
        debug!(interface = %iface, "live capture finished");
    });

    Ok(PacketSource { packets: rx, stop })
}
