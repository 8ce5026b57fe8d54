//! Storage collaborator: the sink for connection lifecycle and transaction
//! events produced while reassembling traffic.
//!
//! Every operation can fail; callers log failures and keep going, losing that
//! single event rather than stalling capture.

pub mod recorder;

pub use recorder::{
    ConnectionRecord, EventRecorder, Records, RequestSummary, ResponseSummary, Stamped,
    StorageEvent, Transaction,
};

use std::time::SystemTime;

use thiserror::Error;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::tracker::ConnectionId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait Storage: Send + Sync {
    /// Both directions of a connection have been observed.
    fn open_connection(&self, id: ConnectionId, at: SystemTime) -> Result<(), StorageError>;

    /// The request direction of a connection reached end-of-input.
    fn close_connection(&self, id: ConnectionId, at: SystemTime) -> Result<(), StorageError>;

    /// Payload bytes carried by a server-to-client packet.
    fn incoming_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError>;

    /// Payload bytes carried by a client-to-server packet.
    fn outgoing_payload(&self, id: ConnectionId, bytes: u32) -> Result<(), StorageError>;

    /// The `seq`-th request of a connection was fully parsed.
    fn request_sent(
        &self,
        id: ConnectionId,
        seq: u64,
        at: SystemTime,
        request: &Request,
    ) -> Result<(), StorageError>;

    /// The response to the `seq`-th request was fully parsed. `request` is the
    /// request it was matched with.
    fn response_received(
        &self,
        id: ConnectionId,
        seq: u64,
        at: SystemTime,
        request: &Request,
        response: &Response,
    ) -> Result<(), StorageError>;
}
