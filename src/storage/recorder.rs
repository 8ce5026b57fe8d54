//! In-process [`Storage`] implementation.
//!
//! Calls never block: each one becomes a [`StorageEvent`] on an unbounded
//! channel. A single writer task folds the events into [`Records`] and, when
//! configured with a path, appends each one to a JSON-lines file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::http::request::Request;
use crate::http::response::Response;
use crate::storage::{Storage, StorageError};
use crate::tracker::ConnectionId;

fn epoch_millis<S: Serializer>(at: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    s.serialize_u64(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub method: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub body_bytes: u64,
}

impl From<&Request> for RequestSummary {
    fn from(request: &Request) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            target: request.target.clone(),
            host: request.host().map(str::to_string),
            body_bytes: request.body_len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseSummary {
    pub status: u16,
    pub reason: String,
    pub body_bytes: u64,
}

impl From<&Response> for ResponseSummary {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status.as_u16(),
            reason: response.reason.clone(),
            body_bytes: response.body_len,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StorageEvent {
    ConnectionOpened {
        connection: ConnectionId,
        #[serde(serialize_with = "epoch_millis")]
        at: SystemTime,
    },
    ConnectionClosed {
        connection: ConnectionId,
        #[serde(serialize_with = "epoch_millis")]
        at: SystemTime,
    },
    IncomingPayload {
        connection: ConnectionId,
        bytes: u32,
    },
    OutgoingPayload {
        connection: ConnectionId,
        bytes: u32,
    },
    RequestSent {
        connection: ConnectionId,
        seq: u64,
        #[serde(serialize_with = "epoch_millis")]
        at: SystemTime,
        request: RequestSummary,
    },
    ResponseReceived {
        connection: ConnectionId,
        seq: u64,
        #[serde(serialize_with = "epoch_millis")]
        at: SystemTime,
        request: RequestSummary,
        response: ResponseSummary,
    },
}

/// A summary and the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped<T> {
    pub at: SystemTime,
    pub summary: T,
}

/// Everything recorded about one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    pub opened: Option<SystemTime>,
    pub closed: Option<SystemTime>,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub requests: BTreeMap<u64, Stamped<RequestSummary>>,
    pub responses: BTreeMap<u64, Stamped<ResponseSummary>>,
}

/// A request paired with its response, if one was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub connection: ConnectionId,
    pub seq: u64,
    pub request: RequestSummary,
    pub response: Option<ResponseSummary>,
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct Records {
    connections: BTreeMap<ConnectionId, ConnectionRecord>,
}

impl Records {
    pub fn apply(&mut self, event: StorageEvent) {
        match event {
            StorageEvent::ConnectionOpened { connection, at } => {
                self.entry(connection).opened = Some(at);
            }
            StorageEvent::ConnectionClosed { connection, at } => {
                self.entry(connection).closed = Some(at);
            }
            StorageEvent::IncomingPayload { connection, bytes } => {
                self.entry(connection).incoming_bytes += u64::from(bytes);
            }
            StorageEvent::OutgoingPayload { connection, bytes } => {
                self.entry(connection).outgoing_bytes += u64::from(bytes);
            }
            StorageEvent::RequestSent {
                connection,
                seq,
                at,
                request,
            } => {
                self.entry(connection).requests.insert(
                    seq,
                    Stamped {
                        at,
                        summary: request,
                    },
                );
            }
            StorageEvent::ResponseReceived {
                connection,
                seq,
                at,
                response,
                ..
            } => {
                self.entry(connection).responses.insert(
                    seq,
                    Stamped {
                        at,
                        summary: response,
                    },
                );
            }
        }
    }

    fn entry(&mut self, id: ConnectionId) -> &mut ConnectionRecord {
        self.connections.entry(id).or_default()
    }

    pub fn connections(&self) -> &BTreeMap<ConnectionId, ConnectionRecord> {
        &self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&id)
    }

    /// Requests paired with responses by sequence index, ordered by
    /// connection then sequence.
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut out = Vec::new();
        for (&connection, record) in &self.connections {
            for (&seq, request) in &record.requests {
                let response = record.responses.get(&seq);
                out.push(Transaction {
                    connection,
                    seq,
                    request: request.summary.clone(),
                    response: response.map(|r| r.summary.clone()),
                    latency: response.and_then(|r| r.at.duration_since(request.at).ok()),
                });
            }
        }
        out
    }
}

/// [`Storage`] that records events in memory and optionally as JSON lines.
pub struct EventRecorder {
    events: Mutex<Option<mpsc::UnboundedSender<StorageEvent>>>,
    writer: Mutex<Option<JoinHandle<Result<Records, StorageError>>>>,
}

impl EventRecorder {
    /// Starts the writer task. Must be called inside a Tokio runtime.
    pub async fn open(events_path: Option<&Path>) -> Result<Self, StorageError> {
        let out = match events_path {
            Some(path) => {
                debug!(path = %path.display(), "writing events");
                Some(BufWriter::new(File::create(path).await?))
            }
            None => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_events(rx, out));

        Ok(Self {
            events: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Stops accepting events, waits for every pending one to be written and
    /// returns what was recorded.
    pub async fn close(&self) -> Result<Records, StorageError> {
        drop(lock(&self.events).take());
        let writer = lock(&self.writer).take().ok_or(StorageError::Closed)?;
        match writer.await {
            Ok(records) => records,
            Err(e) => Err(StorageError::Io(std::io::Error::other(e))),
        }
    }

    fn record(&self, event: StorageEvent) -> Result<(), StorageError> {
        match lock(&self.events).as_ref() {
            Some(events) => events.send(event).map_err(|_| StorageError::Closed),
            None => Err(StorageError::Closed),
        }
    }
}

impl Storage for EventRecorder {
    fn open_connection(&self, id: ConnectionId, at: SystemTime) -> Result<(), StorageError> {
        self.record(StorageEvent::ConnectionOpened { connection: id, at })
    }

    fn close_connection(&self, id: ConnectionId, at: SystemTime) -> Result<(), StorageError> {
        self.record(StorageEvent::ConnectionClosed { connection: id, at })
    }

    fn incoming_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError> {
        self.record(StorageEvent::IncomingPayload {
            connection: id,
            bytes,
        })
    }

    fn outgoing_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError> {
        self.record(StorageEvent::OutgoingPayload {
            connection: id,
            bytes,
        })
    }

    fn request_sent(
        &self,
        id: ConnectionId,
        seq: u64,
        at: SystemTime,
        request: &Request,
    ) -> Result<(), StorageError> {
        self.record(StorageEvent::RequestSent {
            connection: id,
            seq,
            at,
            request: request.into(),
        })
    }

    fn response_received(
        &self,
        id: ConnectionId,
        seq: u64,
        at: SystemTime,
        request: &Request,
        response: &Response,
    ) -> Result<(), StorageError> {
        self.record(StorageEvent::ResponseReceived {
            connection: id,
            seq,
            at,
            request: request.into(),
            response: response.into(),
        })
    }
}

async fn write_events(
    mut events: mpsc::UnboundedReceiver<StorageEvent>,
    mut out: Option<BufWriter<File>>,
) -> Result<Records, StorageError> {
    let mut records = Records::default();

    while let Some(event) = events.recv().await {
        if let Some(file) = out.as_mut() {
            if let Err(e) = write_line(file, &event).await {
                warn!(error = %e, "error writing event, keeping the rest in memory only");
                out = None;
            }
        }
        records.apply(event);
    }

    if let Some(mut file) = out {
        file.flush().await?;
    }
    Ok(records)
}

async fn write_line(out: &mut BufWriter<File>, event: &StorageEvent) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
