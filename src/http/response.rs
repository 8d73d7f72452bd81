//! Outgoing responses and their wire encoding.
//!
//! A [`Response`] is assembled by the engine and encoded exactly once with
//! [`Response::into_bytes`]. The connection is always closed afterwards, so
//! every response announces `Connection: close`.

use std::fmt::Write as _;
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// Value of the `Server` header and the CGI `SERVER_SOFTWARE` variable.
pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Type announced for a body that was given no `Content-Type`.
const FALLBACK_CONTENT_TYPE: &str = "text/plain";

/// A status, caller-supplied header fields and a body.
///
/// # Examples
///
/// ```
/// use webserv::http::{Response, StatusCode};
///
/// let wire = Response::new(StatusCode::Created)
///     .header("Location", "/uploads/a.txt")
///     .body("stored")
///     .into_bytes();
///
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(text.contains("Connection: close\r\nContent-Length: 6\r\n"));
/// assert!(text.ends_with("\r\n\r\nstored"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    fields: Headers,
    body: Vec<u8>,
    /// Encode the head only (`HEAD` requests).
    head_only: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            fields: Headers::new(),
            body: Vec::new(),
            head_only: false,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    /// Adds a field after construction. Repeated names are all written.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name, value);
    }

    #[must_use]
    pub fn body(self, body: impl Into<String>) -> Self {
        self.body_bytes(body.into())
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// When `head_only` is set the body is left off the wire, but
    /// `Content-Length` still reports its size.
    #[must_use]
    pub fn without_body(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.fields
    }

    /// Encodes the response.
    ///
    /// The head is the status line, then `Date`, `Server`, `Connection` and
    /// `Content-Length`, then the caller's fields in insertion order. A
    /// non-empty body with no `Content-Type` is labelled `text/plain`.
    pub fn into_bytes(self) -> BytesMut {
        let Self {
            status,
            mut fields,
            body,
            head_only,
        } = self;

        if !body.is_empty() && !fields.contains("Content-Type") {
            fields.insert("Content-Type", FALLBACK_CONTENT_TYPE);
        }

        let mut wire = BytesMut::with_capacity(256 + fields.len() * 48 + body.len());
        // writing into a BytesMut cannot fail
        let _ = write!(
            wire,
            "HTTP/1.1 {} {}\r\n\
             Date: {}\r\n\
             Server: {SERVER_SOFTWARE}\r\n\
             Connection: close\r\n\
             Content-Length: {}\r\n\
             {fields}\r\n",
            status.as_u16(),
            status.canonical_reason(),
            httpdate::fmt_http_date(SystemTime::now()),
            body.len(),
        );

        if !head_only {
            wire.put_slice(&body);
        }
        wire
    }
}
