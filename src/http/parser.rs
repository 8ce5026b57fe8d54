use std::collections::HashMap;

use thiserror::Error;

use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};

/// Largest message head accepted before the message is declared malformed.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("invalid status line")]
    InvalidResponse,
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid header")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid chunked encoding")]
    InvalidChunk,
    #[error("message head larger than {MAX_HEAD_BYTES} bytes")]
    HeadersTooLarge,
    #[error("incomplete message")]
    Incomplete,
}

/// How the body following a message head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding, terminated by a zero-size chunk and trailers.
    Chunked,
    /// Everything until the connection closes.
    UntilClose,
}

/// Parses a request head. On success returns the request (with an empty
/// body) and the number of bytes the head occupied.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(incomplete(buf)),
        Err(e) => return Err(map_error(e, ParseError::InvalidRequest)),
    };

    let method_str = req.method.ok_or(ParseError::InvalidRequest)?;
    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let target = req.path.ok_or(ParseError::InvalidRequest)?;
    let version = version_string(req.version.ok_or(ParseError::InvalidRequest)?);
    let headers = collect_headers(req.headers)?;

    let request = Request {
        method,
        target: target.to_string(),
        version,
        headers,
        body_len: 0,
    };

    Ok((request, consumed))
}

/// Parses a response head. On success returns the response (with an empty
/// body) and the number of bytes the head occupied.
pub fn parse_http_response(buf: &[u8]) -> Result<(Response, usize), ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let consumed = match res.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(incomplete(buf)),
        Err(e) => return Err(map_error(e, ParseError::InvalidResponse)),
    };

    let code = res.code.ok_or(ParseError::InvalidResponse)?;
    let version = version_string(res.version.ok_or(ParseError::InvalidResponse)?);
    let headers = collect_headers(res.headers)?;

    let response = Response {
        status: StatusCode(code),
        reason: res.reason.unwrap_or_default().to_string(),
        version,
        headers,
        body_len: 0,
    };

    Ok((response, consumed))
}

/// Body framing of a request.
pub fn request_framing(request: &Request) -> Result<BodyFraming, ParseError> {
    if let Some(te) = request.header("Transfer-Encoding") {
        return if is_chunked(te) {
            Ok(BodyFraming::Chunked)
        } else {
            // A request body without a length cannot be delimited.
            Err(ParseError::InvalidRequest)
        };
    }
    match request.header("Content-Length") {
        Some(v) => Ok(BodyFraming::Length(parse_content_length(v)?)),
        None => Ok(BodyFraming::Empty),
    }
}

/// Body framing of a response, which depends on the request it answers.
pub fn response_framing(request: &Request, response: &Response) -> Result<BodyFraming, ParseError> {
    let status = response.status;

    if request.method == Method::HEAD
        || (status.is_informational() && status.as_u16() != 101)
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    if status.as_u16() == 101 || (request.method == Method::CONNECT && status.is_success()) {
        return Ok(BodyFraming::UntilClose);
    }
    if let Some(te) = response.header("Transfer-Encoding") {
        return Ok(if is_chunked(te) {
            BodyFraming::Chunked
        } else {
            BodyFraming::UntilClose
        });
    }
    match response.header("Content-Length") {
        Some(v) => Ok(BodyFraming::Length(parse_content_length(v)?)),
        None => Ok(BodyFraming::UntilClose),
    }
}

/// Parses a chunk-size line. Returns the line length (CRLF included) and the
/// chunk size.
pub fn parse_chunk_size(buf: &[u8]) -> Result<(usize, u64), ParseError> {
    match httparse::parse_chunk_size(buf) {
        Ok(httparse::Status::Complete((consumed, size))) => Ok((consumed, size)),
        Ok(httparse::Status::Partial) => Err(ParseError::Incomplete),
        Err(_) => Err(ParseError::InvalidChunk),
    }
}

fn is_chunked(transfer_encoding: &str) -> bool {
    transfer_encoding
        .rsplit(',')
        .next()
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidContentLength)
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HashMap<String, String>, ParseError> {
    let mut headers: HashMap<String, String> = HashMap::with_capacity(raw.len());

    for h in raw {
        let value = String::from_utf8_lossy(h.value).trim().to_string();
        let existing = headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(h.name))
            .cloned();

        match existing {
            Some(key) if h.name.eq_ignore_ascii_case("Content-Length") => {
                if headers.get(&key) != Some(&value) {
                    return Err(ParseError::InvalidContentLength);
                }
            }
            Some(key) => {
                if let Some(joined) = headers.get_mut(&key) {
                    joined.push_str(", ");
                    joined.push_str(&value);
                }
            }
            None => {
                headers.insert(h.name.to_string(), value);
            }
        }
    }

    Ok(headers)
}

fn version_string(minor: u8) -> String {
    format!("HTTP/1.{minor}")
}

fn incomplete(buf: &[u8]) -> ParseError {
    if buf.len() > MAX_HEAD_BYTES {
        ParseError::HeadersTooLarge
    } else {
        ParseError::Incomplete
    }
}

fn map_error(e: httparse::Error, start_line: ParseError) -> ParseError {
    match e {
        httparse::Error::HeaderName | httparse::Error::HeaderValue => ParseError::InvalidHeader,
        httparse::Error::TooManyHeaders => ParseError::HeadersTooLarge,
        _ => start_line,
    }
}
