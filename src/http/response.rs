use std::collections::HashMap;
use std::fmt;

use crate::http::request::find_header;

/// HTTP status code as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const NOT_FOUND: StatusCode = StatusCode(404);

    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use httptap::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard reason phrase, or an empty string for codes
    /// without a well-known one.
    ///
    /// ```
    /// # use httptap::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NOT_FOUND.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }

    /// 1xx codes.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A response parsed off the inbound direction of a connection.
#[derive(Debug, Clone)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// Reason phrase as sent by the server
    pub reason: String,
    /// HTTP version (e.g. "HTTP/1.1")
    pub version: String,
    /// HTTP headers as key-value pairs, names as received
    pub headers: HashMap<String, String>,
    /// Number of body bytes that followed the head
    pub body_len: u64,
}

/// Builder for constructing responses in a fluent style, mostly for tests
/// and storage fixtures.
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body_len(2)
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    reason: Option<String>,
    version: String,
    headers: HashMap<String, String>,
    body_len: u64,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            body_len: 0,
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn body_len(mut self, body_len: u64) -> Self {
        self.body_len = body_len;
        self
    }

    /// Builds the final Response. The reason phrase defaults to the standard
    /// one for the status code.
    pub fn build(self) -> Response {
        let reason = self
            .reason
            .unwrap_or_else(|| self.status.reason_phrase().to_string());

        Response {
            status: self.status,
            reason,
            version: self.version,
            headers: self.headers,
            body_len: self.body_len,
        }
    }
}

impl Response {
    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }
}
