#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use etherparse::PacketBuilder;
use tokio::sync::mpsc;

use httptap::assembly::Assembler;
use httptap::capture::packet::{CapturedPacket, LinkType, decode};
use httptap::capture::{PacketSource, PortScope};
use httptap::driver::{Driver, DriverConfig, DriverSummary};
use httptap::http::request::Request;
use httptap::http::response::Response;
use httptap::storage::{Storage, StorageError};
use httptap::tracker::{ConnectionId, StreamRegistry};

/// One storage call, as seen by [`CollectingStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(ConnectionId),
    Closed(ConnectionId),
    Incoming(ConnectionId, u32),
    Outgoing(ConnectionId, u32),
    Request {
        id: ConnectionId,
        seq: u64,
        method: String,
        target: String,
    },
    Response {
        id: ConnectionId,
        seq: u64,
        request_target: String,
        status: u16,
        body_len: u64,
    },
}

/// Storage that keeps every call in order. Can be told to fail every call.
#[derive(Default)]
pub struct CollectingStorage {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl CollectingStorage {
    pub fn failing() -> Self {
        let storage = Self::default();
        storage.failing.store(true, Ordering::SeqCst);
        storage
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(ConnectionId, u64, String, String)> {
        let mut out: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Request {
                    id,
                    seq,
                    method,
                    target,
                } => Some((id, seq, method, target)),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    /// `(id, seq, request target, status)` sorted by connection then seq.
    pub fn responses(&self) -> Vec<(ConnectionId, u64, String, u16)> {
        let mut out: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Response {
                    id,
                    seq,
                    request_target,
                    status,
                    ..
                } => Some((id, seq, request_target, status)),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: Event) -> Result<(), StorageError> {
        self.events.lock().unwrap().push(event);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Storage for CollectingStorage {
    fn open_connection(&self, id: ConnectionId, _at: SystemTime) -> Result<(), StorageError> {
        self.push(Event::Opened(id))
    }

    fn close_connection(&self, id: ConnectionId, _at: SystemTime) -> Result<(), StorageError> {
        self.push(Event::Closed(id))
    }

    fn incoming_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError> {
        self.push(Event::Incoming(id, bytes))
    }

    fn outgoing_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError> {
        self.push(Event::Outgoing(id, bytes))
    }

    fn request_sent(
        &self,
        id: ConnectionId,
        seq: u64,
        _at: SystemTime,
        request: &Request,
    ) -> Result<(), StorageError> {
        self.push(Event::Request {
            id,
            seq,
            method: request.method.to_string(),
            target: request.target.clone(),
        })
    }

    fn response_received(
        &self,
        id: ConnectionId,
        seq: u64,
        _at: SystemTime,
        request: &Request,
        response: &Response,
    ) -> Result<(), StorageError> {
        self.push(Event::Response {
            id,
            seq,
            request_target: request.target.clone(),
            status: response.status.as_u16(),
            body_len: response.body_len,
        })
    }
}

/// Builds Ethernet frames for one TCP connection, tracking both sides'
/// sequence numbers.
pub struct TcpConversation {
    client: (Ipv4Addr, u16),
    server: (Ipv4Addr, u16),
    client_seq: u32,
    server_seq: u32,
}

impl TcpConversation {
    pub fn new(client_port: u16, server_port: u16) -> Self {
        Self {
            client: (Ipv4Addr::new(10, 0, 0, 1), client_port),
            server: (Ipv4Addr::new(10, 0, 0, 2), server_port),
            client_seq: 1000,
            server_seq: 5000,
        }
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq
    }

    /// The three-way handshake.
    pub fn handshake(&mut self) -> Vec<Vec<u8>> {
        let syn = frame(self.client, self.server, self.client_seq, Flags::Syn, b"");
        self.client_seq = self.client_seq.wrapping_add(1);
        let syn_ack = frame(self.server, self.client, self.server_seq, Flags::Syn, b"");
        self.server_seq = self.server_seq.wrapping_add(1);
        let ack = frame(self.client, self.server, self.client_seq, Flags::None, b"");
        vec![syn, syn_ack, ack]
    }

    pub fn client_sends(&mut self, data: &[u8]) -> Vec<u8> {
        let f = frame(self.client, self.server, self.client_seq, Flags::None, data);
        self.client_seq = self.client_seq.wrapping_add(data.len() as u32);
        f
    }

    pub fn server_sends(&mut self, data: &[u8]) -> Vec<u8> {
        let f = frame(self.server, self.client, self.server_seq, Flags::None, data);
        self.server_seq = self.server_seq.wrapping_add(data.len() as u32);
        f
    }

    /// Client data at an explicit sequence number, without advancing.
    pub fn client_at(&self, seq: u32, data: &[u8]) -> Vec<u8> {
        frame(self.client, self.server, seq, Flags::None, data)
    }

    pub fn client_fin(&mut self) -> Vec<u8> {
        let f = frame(self.client, self.server, self.client_seq, Flags::Fin, b"");
        self.client_seq = self.client_seq.wrapping_add(1);
        f
    }

    pub fn server_fin(&mut self) -> Vec<u8> {
        let f = frame(self.server, self.client, self.server_seq, Flags::Fin, b"");
        self.server_seq = self.server_seq.wrapping_add(1);
        f
    }

    pub fn client_rst(&self) -> Vec<u8> {
        frame(self.client, self.server, self.client_seq, Flags::Rst, b"")
    }
}

#[derive(Clone, Copy)]
enum Flags {
    None,
    Syn,
    Fin,
    Rst,
}

fn frame(from: (Ipv4Addr, u16), to: (Ipv4Addr, u16), seq: u32, flags: Flags, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(from.0.octets(), to.0.octets(), 64)
        .tcp(from.1, to.1, seq, 65535);
    let builder = match flags {
        Flags::None => builder,
        Flags::Syn => builder.syn(),
        Flags::Fin => builder.fin(),
        Flags::Rst => builder.rst(),
    };

    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

pub fn decoded(frame: &[u8]) -> CapturedPacket {
    decode(frame, LinkType::Ethernet, SystemTime::now()).expect("frame is TCP over IPv4")
}

pub fn decoded_all(frames: &[Vec<u8>]) -> Vec<CapturedPacket> {
    frames.iter().map(|f| decoded(f)).collect()
}

pub fn driver_config() -> DriverConfig {
    DriverConfig {
        after_exhaustion: Duration::ZERO,
        after_command: Duration::ZERO,
        join_grace: Duration::from_secs(5),
        log_packets: false,
    }
}

/// Runs a full capture over `packets` with port 80 in scope.
pub async fn run_packets(packets: Vec<CapturedPacket>, storage: Arc<dyn Storage>) -> DriverSummary {
    run_packets_with_queue(packets, storage, 100).await
}

/// Like [`run_packets`], with at most `queue_capacity` unanswered requests
/// per connection.
pub async fn run_packets_with_queue(
    packets: Vec<CapturedPacket>,
    storage: Arc<dyn Storage>,
    queue_capacity: usize,
) -> DriverSummary {
    let (tx, rx) = mpsc::channel(packets.len().max(1));
    for packet in packets {
        tx.send(packet).await.unwrap();
    }
    drop(tx);
    run_source_with_queue(PacketSource::from_channel(rx), storage, queue_capacity).await
}

pub async fn run_source(source: PacketSource, storage: Arc<dyn Storage>) -> DriverSummary {
    run_source_with_queue(source, storage, 100).await
}

async fn run_source_with_queue(
    source: PacketSource,
    storage: Arc<dyn Storage>,
    queue_capacity: usize,
) -> DriverSummary {
    let registry = Arc::new(StreamRegistry::new(storage, queue_capacity));
    let assembler = Assembler::new(registry.clone());
    let mut driver = Driver::new(
        driver_config(),
        Box::new(PortScope::new(vec![80])),
        registry,
        assembler,
    );
    driver
        .run(source, None, std::future::pending::<()>())
        .await
        .unwrap()
}
