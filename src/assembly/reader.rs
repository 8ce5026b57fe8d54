//! Ordered byte delivery for one direction of a TCP connection.
//!
//! The reassembler owns the [`StreamSender`]; the reader task owns the
//! [`ReaderStream`]. Dropping the sender is end-of-input.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Creates a connected sender/reader pair.
pub fn channel() -> (StreamSender, ReaderStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx }, ReaderStream { rx })
}

#[derive(Debug)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl StreamSender {
    /// Hands in-order bytes to the reader. Bytes for a reader that has gone
    /// away are dropped.
    pub fn deliver(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(data);
    }

    /// True once the reading side has been dropped.
    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct ReaderStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ReaderStream {
    /// Waits for the next chunk of in-order bytes. `None` means the stream
    /// reached end-of-input and nothing more will arrive.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}
