//! In-order reassembly of captured TCP segments.
//!
//! Each direction of a connection is a half-stream keyed by its directed
//! flow. Bytes are handed to the half-stream's [`StreamSender`] strictly in
//! sequence order; segments that arrive early wait until the gap before them
//! fills, or until the stream is flushed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::assembly::reader::StreamSender;
use crate::capture::packet::{CapturedPacket, NetworkFlow, TransportFlow};

/// Upper bound on out-of-order segments held per half-stream. Past it the
/// oldest gap is given up on.
pub const MAX_BUFFERED_SEGMENTS: usize = 1024;

/// Creates the consumer for a newly seen half-stream.
pub trait StreamFactory {
    fn new_stream(&self, net: NetworkFlow, transport: TransportFlow) -> StreamSender;
}

impl<F: StreamFactory + ?Sized> StreamFactory for Arc<F> {
    fn new_stream(&self, net: NetworkFlow, transport: TransportFlow) -> StreamSender {
        (**self).new_stream(net, transport)
    }
}

type FlowKey = (NetworkFlow, TransportFlow);

struct HalfStream {
    /// `None` once the half-stream is closed.
    sender: Option<StreamSender>,
    /// Sequence number of stream offset zero.
    base: u32,
    /// Offset of the next byte expected.
    next: u32,
    /// Offset at which the peer's FIN sits.
    fin_at: Option<u32>,
    /// Early segments by offset.
    pending: BTreeMap<u32, Bytes>,
}

impl HalfStream {
    fn new(sender: StreamSender, base: u32) -> Self {
        Self {
            sender: Some(sender),
            base,
            next: 0,
            fin_at: None,
            pending: BTreeMap::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    fn offset_of(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.base)
    }

    fn add_segment(&mut self, seq: u32, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        // Signed distance from the next expected sequence number.
        let delta = seq.wrapping_sub(self.base.wrapping_add(self.next)) as i32;

        if delta < 0 {
            let overlap = delta.unsigned_abs() as usize;
            if overlap >= data.len() {
                trace!(seq, len = data.len(), "dropping retransmitted segment");
                return;
            }
            data = data.slice(overlap..);
        } else if delta > 0 {
            self.pending.insert(self.next.wrapping_add(delta as u32), data);
            if self.pending.len() > MAX_BUFFERED_SEGMENTS {
                self.skip_gap();
            }
            return;
        }

        self.deliver(data);
        self.release_pending();
    }

    fn deliver(&mut self, data: Bytes) {
        self.next = self.next.wrapping_add(data.len() as u32);
        if let Some(sender) = &self.sender {
            sender.deliver(data);
        }
    }

    /// Delivers buffered segments that have become contiguous.
    fn release_pending(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            if offset > self.next {
                break;
            }
            let data = entry.remove();
            let end = offset.wrapping_add(data.len() as u32);
            if end <= self.next {
                continue;
            }
            let skip = (self.next - offset) as usize;
            self.deliver(data.slice(skip..));
        }
    }

    /// Gives up on the bytes missing before the first buffered segment.
    fn skip_gap(&mut self) {
        if let Some((&offset, _)) = self.pending.first_key_value() {
            trace!(missing = offset.wrapping_sub(self.next), "skipping reassembly gap");
            self.next = offset;
            self.release_pending();
        }
    }

    fn close_if_finished(&mut self) {
        if let Some(fin_at) = self.fin_at {
            if self.next >= fin_at && self.pending.is_empty() {
                self.sender = None;
            }
        }
    }

    /// Delivers everything buffered, skipping gaps, then closes.
    fn flush(&mut self) {
        while !self.pending.is_empty() {
            self.skip_gap();
        }
        self.sender = None;
    }
}

/// Reassembles captured segments into ordered per-direction byte streams.
pub struct Assembler<F: StreamFactory> {
    factory: F,
    streams: HashMap<FlowKey, HalfStream>,
    opened: u64,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            streams: HashMap::new(),
            opened: 0,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Feeds one captured TCP packet.
    pub fn assemble(&mut self, packet: &CapturedPacket) {
        let key = (packet.net, packet.transport);
        let tcp = &packet.tcp;
        // Payload on a SYN starts after the sequence number the SYN consumes.
        let data_seq = if tcp.syn { tcp.seq.wrapping_add(1) } else { tcp.seq };

        let reopen = match self.streams.get(&key) {
            None => tcp.syn || !packet.payload.is_empty(),
            Some(half) => half.is_closed() && tcp.syn,
        };
        if reopen {
            let sender = self.factory.new_stream(packet.net, packet.transport);
            self.streams.insert(key, HalfStream::new(sender, data_seq));
            self.opened += 1;
        }

        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        if half.is_closed() {
            return;
        }

        half.add_segment(data_seq, packet.payload.clone());

        if tcp.rst {
            half.flush();
            return;
        }
        if tcp.fin {
            let end = half
                .offset_of(data_seq)
                .wrapping_add(packet.payload.len() as u32);
            half.fin_at = Some(end);
        }
        half.close_if_finished();
    }

    /// Flushes and closes every half-stream. Every reader observes
    /// end-of-input afterwards.
    pub fn flush_all(&mut self) {
        for half in self.streams.values_mut() {
            if !half.is_closed() {
                half.flush();
            }
        }
    }

    /// Number of half-streams still open.
    pub fn open_streams(&self) -> usize {
        self.streams.values().filter(|h| !h.is_closed()).count()
    }

    /// Number of half-streams created so far.
    pub fn streams_opened(&self) -> u64 {
        self.opened
    }
}
