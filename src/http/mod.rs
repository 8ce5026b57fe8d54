//! HTTP/1.x message parsing for reassembled traffic.
//!
//! Nothing here ever writes to the network. Messages are read off a
//! direction's ordered byte source, their bodies are skipped and counted, and
//! the heads are kept for storage.
//!
//! # Architecture
//!
//! - **`parser`**: Parses request and response heads from byte buffers and decides body framing
//! - **`request`**: HTTP request representation and header helpers
//! - **`response`**: HTTP response representation with builder pattern
//! - **`stream`**: Message reader over a reassembled byte stream, with recovery after malformed input
//!
//! # Reading a Direction
//!
//! ```text
//!        ┌─────────────┐
//!        │  Head       │ ← Buffer until a full head parses
//!        └──────┬──────┘
//!               │ Head parsed
//!               ▼
//!        ┌──────────────────┐
//!        │   Body           │ ← Skip Content-Length / chunked / until close
//!        └──────┬───────────┘
//!               │ Body skipped
//!               ├─ More bytes → Head (pipelined message)
//!               └─ End of input → Eof
//! ```
//!
//! A response is always read with the request it answers, since the
//! request's method decides whether the response has a body at all.
//!
//! # Example
//!
//! ```ignore
//! use httptap::http::stream::MessageReader;
//!
//! let mut requests = MessageReader::new(outbound);
//! let mut responses = MessageReader::new(inbound);
//!
//! let request = requests.read_request().await?;
//! let response = responses.read_response(&request).await?;
//! println!("{} {} -> {}", request.method, request.target, response.status);
//! ```

pub mod parser;
pub mod request;
pub mod response;
pub mod stream;
