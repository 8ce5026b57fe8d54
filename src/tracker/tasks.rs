//! The reader tasks, one per observed direction of a connection.
//!
//! Each task runs until its byte source reaches end-of-input. There is no
//! other way out: shutdown works by flushing the reassembler, which ends
//! every source.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assembly::reader::ReaderStream;
use crate::http::request::Request;
use crate::http::stream::{MessageKind, MessageReader, ReadError};
use crate::storage::Storage;
use crate::tracker::bidi::StreamHandle;
use crate::tracker::connection_id::ConnectionId;

pub struct ReaderTask {
    id: ConnectionId,
    handle: StreamHandle,
    storage: Arc<dyn Storage>,
}

impl ReaderTask {
    pub fn new(id: ConnectionId, handle: StreamHandle, storage: Arc<dyn Storage>) -> Self {
        Self {
            id,
            handle,
            storage,
        }
    }

    /// Parses requests off the client-to-server direction and queues each
    /// one for the response side. Reports the connection closed once the
    /// direction reaches end-of-input.
    pub async fn run_outbound(
        self,
        source: ReaderStream,
        mut requests: Option<mpsc::Sender<Arc<Request>>>,
    ) {
        let mut messages = MessageReader::new(source);
        let mut seq: u64 = 0;

        loop {
            match messages.read_request().await {
                Ok(request) => {
                    let request = Arc::new(request);

                    // Blocks while the queue is full.
                    let queue_closed = match &requests {
                        Some(queue) => queue.send(request.clone()).await.is_err(),
                        None => false,
                    };
                    if queue_closed {
                        debug!(
                            connection = %self.id,
                            seq,
                            "response side is gone, requests will stay unmatched"
                        );
                        requests = None;
                    }

                    if let Err(e) =
                        self.storage
                            .request_sent(self.id, seq, SystemTime::now(), &request)
                    {
                        warn!(connection = %self.id, seq, error = %e, "error storing request");
                    }
                    seq += 1;
                }
                Err(ReadError::Eof) => break,
                Err(e) => {
                    let dropped = match e {
                        ReadError::UnexpectedEof => messages.discard_buffered(),
                        _ => messages.resync(MessageKind::Request),
                    };
                    self.report_read_error(&e, dropped);
                }
            }
        }

        if let Err(e) = self.storage.close_connection(self.id, SystemTime::now()) {
            warn!(connection = %self.id, error = %e, "error storing connection close");
        }
        self.handle.finish();
        debug!(connection = %self.id, requests = seq, "request stream finished");
    }

    /// Parses responses off the server-to-client direction, matching each
    /// with the oldest unanswered request.
    pub async fn run_inbound(
        self,
        source: ReaderStream,
        mut requests: Option<mpsc::Receiver<Arc<Request>>>,
    ) {
        let mut messages = MessageReader::new(source);
        // Request whose response failed to parse; the next response answers it.
        let mut in_progress: Option<Arc<Request>> = None;
        let mut seq: u64 = 0;

        loop {
            // Nothing in flight and nothing more coming.
            if !messages.has_data().await {
                break;
            }

            let request = match in_progress.take() {
                Some(request) => request,
                None => match next_request(&mut requests).await {
                    Some(request) => request,
                    None => {
                        let dropped = messages.discard_to_end().await;
                        debug!(
                            connection = %self.id,
                            dropped,
                            "response bytes without an outstanding request"
                        );
                        break;
                    }
                },
            };

            match messages.read_response(&request).await {
                Ok(response) => {
                    if let Err(e) = self.storage.response_received(
                        self.id,
                        seq,
                        SystemTime::now(),
                        &request,
                        &response,
                    ) {
                        warn!(connection = %self.id, seq, error = %e, "error storing response");
                    }
                    seq += 1;
                }
                Err(ReadError::Eof | ReadError::UnexpectedEof) => break,
                Err(e) => {
                    in_progress = Some(request);
                    let dropped = messages.resync(MessageKind::Response);
                    self.report_read_error(&e, dropped);
                }
            }
        }

        self.handle.finish();
        debug!(connection = %self.id, responses = seq, "response stream finished");
    }

    fn report_read_error(&self, error: &ReadError, dropped: usize) {
        if self.handle.lifecycle().reports_errors() {
            warn!(
                connection = %self.id,
                net = %self.handle.net,
                transport = %self.handle.transport,
                dropped,
                error = %error,
                "error reading stream"
            );
        } else {
            debug!(
                connection = %self.id,
                dropped,
                error = %error,
                "error reading stream during shutdown"
            );
        }
    }
}

async fn next_request(
    requests: &mut Option<mpsc::Receiver<Arc<Request>>>,
) -> Option<Arc<Request>> {
    match requests {
        Some(queue) => queue.recv().await,
        None => None,
    }
}
