//! Per-connection correlation state.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc;

use crate::capture::packet::{NetworkFlow, TransportFlow};
use crate::http::request::Request;
use crate::tracker::connection_id::ConnectionId;
use crate::tracker::lifecycle::{Lifecycle, LifecycleCell};

/// The shared part of one direction of a connection: its flow and its
/// lifecycle. The byte source itself belongs to the reader task.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub net: NetworkFlow,
    pub transport: TransportFlow,
    lifecycle: Arc<LifecycleCell>,
}

impl StreamHandle {
    pub fn new(net: NetworkFlow, transport: TransportFlow) -> Self {
        Self {
            net,
            transport,
            lifecycle: Arc::new(LifecycleCell::new()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn begin_closing(&self) {
        self.lifecycle.begin_closing();
    }

    pub fn finish(&self) {
        self.lifecycle.finish();
    }
}

type RequestSender = mpsc::Sender<Arc<Request>>;
type RequestReceiver = mpsc::Receiver<Arc<Request>>;

/// Both directions of one connection and the queue of requests waiting for
/// their response.
///
/// The queue is the only synchronisation between the two reader tasks: the
/// outbound task pushes each request as it is parsed, the inbound task pops
/// one per response, so the n-th response is matched with the n-th request.
#[derive(Debug)]
pub struct BidiStream {
    id: ConnectionId,
    outbound: StreamHandle,
    inbound: OnceLock<StreamHandle>,
    requests_tx: Mutex<Option<RequestSender>>,
    requests_rx: Mutex<Option<RequestReceiver>>,
}

impl BidiStream {
    /// A connection seen in one direction so far. `capacity` bounds the
    /// number of unanswered requests.
    pub fn new(id: ConnectionId, outbound: StreamHandle, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id,
            outbound,
            inbound: OnceLock::new(),
            requests_tx: Mutex::new(Some(tx)),
            requests_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbound(&self) -> &StreamHandle {
        &self.outbound
    }

    pub fn inbound(&self) -> Option<&StreamHandle> {
        self.inbound.get()
    }

    /// True once both directions have been observed.
    pub fn is_established(&self) -> bool {
        self.inbound.get().is_some()
    }

    /// Sets the inbound direction. Returns `false` if it was already set.
    pub fn attach_inbound(&self, inbound: StreamHandle) -> bool {
        self.inbound.set(inbound).is_ok()
    }

    /// The producing end of the request queue, handed to the outbound task.
    pub fn take_request_sender(&self) -> Option<RequestSender> {
        lock(&self.requests_tx).take()
    }

    /// The consuming end of the request queue, handed to the inbound task.
    pub fn take_request_receiver(&self) -> Option<RequestReceiver> {
        lock(&self.requests_rx).take()
    }

    /// Starts the drain for both directions. A queue nobody consumes is
    /// dropped so an outbound task blocked on it is released.
    pub fn begin_closing(&self) {
        self.outbound.begin_closing();
        if let Some(inbound) = self.inbound.get() {
            inbound.begin_closing();
        }
        drop(self.take_request_receiver());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
