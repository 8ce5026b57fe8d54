//! Connection registry: the map from connection identity to its
//! [`BidiStream`], and the stream factory the reassembler calls whenever it
//! sees a new direction.
//!
//! Entries live for the whole run and are dropped together at shutdown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::assembly::{StreamFactory, StreamSender, channel};
use crate::capture::packet::{NetworkFlow, TransportFlow};
use crate::storage::Storage;
use crate::tracker::bidi::{BidiStream, StreamHandle};
use crate::tracker::connection_id::ConnectionId;
use crate::tracker::tasks::ReaderTask;

/// Outcome of [`StreamRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// First direction of a new connection; the caller's handle became the
    /// outbound side.
    Opened(Arc<BidiStream>),
    /// The identity was already known.
    Existing(Arc<BidiStream>),
}

pub struct StreamRegistry {
    streams: DashMap<ConnectionId, Arc<BidiStream>>,
    storage: Arc<dyn Storage>,
    queue_capacity: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamRegistry {
    pub fn new(storage: Arc<dyn Storage>, queue_capacity: usize) -> Self {
        Self {
            streams: DashMap::new(),
            storage,
            queue_capacity,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Atomic create-or-fetch. The first direction seen for an identity is
    /// taken as the outbound (client-to-server) side.
    pub fn register(&self, id: ConnectionId, outbound: StreamHandle) -> Registration {
        match self.streams.entry(id) {
            Entry::Occupied(entry) => Registration::Existing(entry.get().clone()),
            Entry::Vacant(entry) => {
                let bidi = Arc::new(BidiStream::new(id, outbound, self.queue_capacity));
                entry.insert(bidi.clone());
                Registration::Opened(bidi)
            }
        }
    }

    /// Completes a connection with its second direction and reports it open.
    /// Returns `false` if the connection already had both.
    pub fn attach(&self, bidi: &BidiStream, inbound: StreamHandle) -> bool {
        if !bidi.attach_inbound(inbound) {
            return false;
        }
        if let Err(e) = self.storage.open_connection(bidi.id(), SystemTime::now()) {
            warn!(connection = %bidi.id(), error = %e, "error storing connection open");
        }
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<BidiStream>> {
        self.streams.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Moves every known direction to `Closing`.
    pub fn close_all(&self) {
        for entry in self.streams.iter() {
            entry.value().begin_closing();
        }
        debug!(connections = self.streams.len(), "closing all streams");
    }

    /// Hands over the join handles of reader tasks spawned so far. Handles of
    /// tasks that had already finished by a later spawn are not kept.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

impl StreamFactory for StreamRegistry {
    fn new_stream(&self, net: NetworkFlow, transport: TransportFlow) -> StreamSender {
        let id = ConnectionId::from_flows(&net, &transport);
        let handle = StreamHandle::new(net, transport);
        let (sender, source) = channel();

        match self.register(id, handle.clone()) {
            Registration::Opened(bidi) => {
                debug!(connection = %id, %net, %transport, "reading request stream");
                let task = ReaderTask::new(id, handle, self.storage.clone());
                self.spawn(task.run_outbound(source, bidi.take_request_sender()));
            }
            Registration::Existing(bidi) => {
                if self.attach(&bidi, handle.clone()) {
                    debug!(connection = %id, %net, %transport, "reading response stream");
                    let task = ReaderTask::new(id, handle, self.storage.clone());
                    self.spawn(task.run_inbound(source, bidi.take_request_receiver()));
                } else {
                    // The reader is dropped here, so this direction's bytes go nowhere.
                    debug!(
                        connection = %id,
                        %net,
                        %transport,
                        "connection already has both directions, ignoring stream"
                    );
                }
            }
        }

        sender
    }
}
