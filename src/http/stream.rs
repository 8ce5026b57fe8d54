//! Reading HTTP/1.x messages off one direction's ordered byte source.
//!
//! A [`MessageReader`] accumulates bytes until a complete message head
//! parses, then skips the body according to its framing without keeping it.
//! Bytes after the message stay buffered for the next read, so pipelined
//! messages delivered in a single chunk come out one at a time.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::assembly::reader::ReaderStream;
use crate::http::parser::{
    BodyFraming, ParseError, parse_chunk_size, parse_http_request, parse_http_response,
    request_framing, response_framing,
};
use crate::http::request::{Request, is_tchar};
use crate::http::response::Response;

/// Longest chunk-size line tolerated, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Error)]
pub enum ReadError {
    /// The stream ended cleanly between messages.
    #[error("end of stream")]
    Eof,
    /// The stream ended in the middle of a message.
    #[error("stream ended inside a message")]
    UnexpectedEof,
    #[error("malformed message: {0}")]
    Malformed(#[from] ParseError),
}

/// Which kind of message a direction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

pub struct MessageReader {
    source: ReaderStream,
    buffer: BytesMut,
    eof: bool,
}

impl MessageReader {
    pub fn new(source: ReaderStream) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(4096),
            eof: false,
        }
    }

    /// Number of bytes received but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Waits until at least one byte is available. Returns `false` when the
    /// stream ended with nothing left to read.
    pub async fn has_data(&mut self) -> bool {
        while self.buffer.is_empty() {
            if !self.fill().await {
                return false;
            }
        }
        true
    }

    /// Reads the next request, skipping its body.
    pub async fn read_request(&mut self) -> Result<Request, ReadError> {
        let (mut request, consumed) = self.read_head(parse_http_request).await?;
        self.buffer.advance(consumed);

        let framing = request_framing(&request)?;
        request.body_len = self.skip_body(framing).await?;
        Ok(request)
    }

    /// Reads the response answering `request`, skipping its body. Interim 1xx
    /// responses are consumed and passed over.
    pub async fn read_response(&mut self, request: &Request) -> Result<Response, ReadError> {
        loop {
            let (mut response, consumed) = self.read_head(parse_http_response).await?;
            self.buffer.advance(consumed);

            let framing = response_framing(request, &response)?;
            response.body_len = self.skip_body(framing).await?;

            if response.status.is_informational() && response.status.as_u16() != 101 {
                trace!(status = %response.status, "skipping interim response");
                continue;
            }
            return Ok(response);
        }
    }

    /// Drops undecodable bytes up to the next place a message of `kind` may
    /// start. At least one byte is dropped. Returns the number dropped.
    pub fn resync(&mut self, kind: MessageKind) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        let skip = find_message_start(&self.buffer, kind).unwrap_or(self.buffer.len());
        self.buffer.advance(skip);
        skip
    }

    /// Drops everything currently buffered.
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        n
    }

    /// Reads and drops everything until end-of-input.
    pub async fn discard_to_end(&mut self) -> u64 {
        let mut discarded = self.discard_buffered() as u64;
        if !self.eof {
            while let Some(chunk) = self.source.next_chunk().await {
                discarded += chunk.len() as u64;
            }
            self.eof = true;
        }
        discarded
    }

    async fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.source.next_chunk().await {
            Some(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                true
            }
            None => {
                self.eof = true;
                false
            }
        }
    }

    async fn read_head<T, P>(&mut self, parse: P) -> Result<(T, usize), ReadError>
    where
        P: Fn(&[u8]) -> Result<(T, usize), ParseError>,
    {
        if !self.has_data().await {
            return Err(ReadError::Eof);
        }
        loop {
            match parse(&self.buffer[..]) {
                Ok(parsed) => return Ok(parsed),
                Err(ParseError::Incomplete) => {
                    if !self.fill().await {
                        // Stray line breaks after the last message are not a
                        // truncated message.
                        if self.buffer.iter().all(|b| *b == b'\r' || *b == b'\n') {
                            self.buffer.clear();
                            return Err(ReadError::Eof);
                        }
                        return Err(ReadError::UnexpectedEof);
                    }
                }
                Err(e) => return Err(ReadError::Malformed(e)),
            }
        }
    }

    async fn skip_body(&mut self, framing: BodyFraming) -> Result<u64, ReadError> {
        match framing {
            BodyFraming::Empty => Ok(0),
            BodyFraming::Length(len) => self.skip_exact(len).await,
            BodyFraming::Chunked => self.skip_chunked().await,
            BodyFraming::UntilClose => Ok(self.discard_to_end().await),
        }
    }

    async fn skip_exact(&mut self, len: u64) -> Result<u64, ReadError> {
        let mut remaining = len;
        loop {
            let take = remaining.min(self.buffer.len() as u64) as usize;
            self.buffer.advance(take);
            remaining -= take as u64;
            if remaining == 0 {
                return Ok(len);
            }
            if !self.fill().await {
                return Err(ReadError::UnexpectedEof);
            }
        }
    }

    async fn skip_chunked(&mut self) -> Result<u64, ReadError> {
        let mut total = 0u64;
        loop {
            let size = self.read_chunk_size().await?;
            if size == 0 {
                self.skip_trailers().await?;
                return Ok(total);
            }
            self.skip_exact(size).await?;
            total += size;
            self.expect_crlf().await?;
        }
    }

    async fn read_chunk_size(&mut self) -> Result<u64, ReadError> {
        loop {
            match parse_chunk_size(&self.buffer) {
                Ok((consumed, size)) => {
                    self.buffer.advance(consumed);
                    return Ok(size);
                }
                Err(ParseError::Incomplete) => {
                    if self.buffer.len() > MAX_CHUNK_LINE {
                        return Err(ParseError::InvalidChunk.into());
                    }
                    if !self.fill().await {
                        return Err(ReadError::UnexpectedEof);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn expect_crlf(&mut self) -> Result<(), ReadError> {
        while self.buffer.len() < 2 {
            if !self.fill().await {
                return Err(ReadError::UnexpectedEof);
            }
        }
        if !self.buffer.starts_with(b"\r\n") {
            return Err(ParseError::InvalidChunk.into());
        }
        self.buffer.advance(2);
        Ok(())
    }

    /// Consumes trailer fields up to and including the empty line.
    async fn skip_trailers(&mut self) -> Result<(), ReadError> {
        loop {
            match self.buffer.windows(2).position(|w| w == b"\r\n") {
                Some(0) => {
                    self.buffer.advance(2);
                    return Ok(());
                }
                Some(end) => self.buffer.advance(end + 2),
                None => {
                    if self.buffer.len() > MAX_CHUNK_LINE {
                        return Err(ParseError::InvalidChunk.into());
                    }
                    if !self.fill().await {
                        return Err(ReadError::UnexpectedEof);
                    }
                }
            }
        }
    }
}

/// Offset of the first line start after offset 0 that could begin a message
/// of `kind`. A line that is a prefix of a start token at the end of the
/// buffer counts, since the rest may still arrive.
fn find_message_start(buf: &[u8], kind: MessageKind) -> Option<usize> {
    (1..buf.len()).find(|&i| buf[i - 1] == b'\n' && could_start_message(&buf[i..], kind))
}

fn could_start_message(rest: &[u8], kind: MessageKind) -> bool {
    match kind {
        MessageKind::Request => {
            // Any method token, then a line that names an HTTP/1.x version.
            let token_len = rest.iter().take_while(|&&b| is_tchar(b)).count();
            match rest.get(token_len).copied() {
                None => true,
                Some(b' ') if token_len > 0 => {
                    let line = &rest[token_len..];
                    match line.iter().position(|&b| b == b'\n') {
                        Some(end) => line[..end].windows(7).any(|w| w == b" HTTP/1"),
                        None => true,
                    }
                }
                Some(_) => false,
            }
        }
        MessageKind::Response => {
            let token = b"HTTP/1.";
            if rest.len() >= token.len() {
                rest.starts_with(token)
            } else {
                token.starts_with(rest)
            }
        }
    }
}
