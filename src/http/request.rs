//! Incremental HTTP/1.1 request parsing.
//!
//! A [`Request`] is created per accepted connection and fed every chunk read
//! from the socket. It buffers the header block until the blank line arrives,
//! parses it once, then counts body bytes down against `Content-Length`.
//! Protocol failures never surface as errors: they freeze the request with a
//! terminal [`StatusCode`] that the response engine turns into an error page.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str;
use std::sync::Arc;

use bytes::BytesMut;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use super::multipart::{self, Parts};
use super::{Headers, Method, StatusCode};
use crate::config::{Listen, ServerConfig};

/// Largest header block accepted before the blank line must have arrived.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Body capacity reserved up front; larger bodies grow as bytes arrive.
const MAX_BODY_RESERVE: usize = 64 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// One HTTP request, owned by its connection for the connection's lifetime.
///
/// The request is *in progress* until either its status is set (terminal
/// error) or the header block has been parsed and no body bytes remain
/// outstanding. [`is_complete`](Self::is_complete) reports which.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use webserv::config::{Listen, ServerConfig};
/// use webserv::http::{Method, Request};
///
/// let listen = Listen::new("127.0.0.1", 8080);
/// let config = ServerConfig {
///     listens: [listen.clone()].into(),
///     ..ServerConfig::default()
/// };
/// let configs = [Arc::new(config)];
///
/// let mut request = Request::new("127.0.0.1:50000".parse().unwrap(), listen);
/// request.feed(b"GET /index.html?lang=en HTTP/1.1\r\n", &configs);
/// assert!(!request.is_complete());
///
/// request.feed(b"Host: localhost\r\n\r\n", &configs);
/// assert!(request.is_complete());
/// assert_eq!(request.status(), None);
/// assert_eq!(request.method(), Method::Get);
/// assert_eq!(request.path(), "/index.html");
/// assert_eq!(request.query(), "lang=en");
/// ```
#[derive(Debug)]
pub struct Request {
    client: SocketAddr,
    listen: Listen,
    status: Option<StatusCode>,
    raw_header: Vec<u8>,
    body: BytesMut,
    bytes_to_read: usize,
    /// `None` until the header block has been parsed.
    method: Option<Method>,
    path: String,
    query: String,
    headers: Headers,
    server_name: String,
    server_config: Option<Arc<ServerConfig>>,
    uploaded_files: Vec<String>,
}

impl Request {
    pub fn new(client: SocketAddr, listen: Listen) -> Self {
        Self {
            client,
            listen,
            status: None,
            raw_header: Vec::new(),
            body: BytesMut::new(),
            bytes_to_read: 0,
            method: None,
            path: String::new(),
            query: String::new(),
            headers: Headers::new(),
            server_name: String::new(),
            server_config: None,
            uploaded_files: Vec::new(),
        }
    }

    /// Feeds one chunk read from the socket.
    ///
    /// Before the header block is complete the bytes are buffered; once the
    /// blank line is present the cold parse runs on everything buffered so
    /// far. Afterwards, chunks are body continuation. A terminal request
    /// ignores further input.
    pub fn feed(&mut self, chunk: &[u8], configs: &[Arc<ServerConfig>]) {
        if self.status.is_some() {
            return;
        }
        if self.is_initialized() {
            self.append_body(chunk);
            return;
        }

        self.raw_header.extend_from_slice(chunk);
        match find(&self.raw_header, HEADER_TERMINATOR) {
            Some(end) if end > MAX_HEADER_SIZE => {
                self.method = Some(Method::Unknown);
                self.fail(StatusCode::RequestHeaderFieldsTooLarge);
            }
            Some(_) => {
                let raw = std::mem::take(&mut self.raw_header);
                self.init(&raw, configs);
            }
            None if self.raw_header.len() > MAX_HEADER_SIZE => {
                self.method = Some(Method::Unknown);
                self.fail(StatusCode::RequestHeaderFieldsTooLarge);
            }
            None => {}
        }
    }

    /// Cold parse: initializes the request from the first bytes of a
    /// connection, which must contain the whole header block.
    pub fn init(&mut self, raw: &[u8], configs: &[Arc<ServerConfig>]) {
        self.method = Some(Method::Unknown);
        if let Err(status) = self.parse_head(raw, configs) {
            self.fail(status);
        }
    }

    /// Warm parse: appends body bytes. More bytes than the declared
    /// `Content-Length` is a protocol violation and terminates the request.
    pub fn append_body(&mut self, chunk: &[u8]) {
        if self.status.is_some() {
            return;
        }
        if let Err(status) = self.push_body(chunk) {
            self.fail(status);
        }
    }

    fn parse_head(&mut self, raw: &[u8], configs: &[Arc<ServerConfig>]) -> Result<(), StatusCode> {
        let split = find(raw, HEADER_TERMINATOR).ok_or(StatusCode::BadRequest)?;
        let head = str::from_utf8(&raw[..split]).map_err(|_| StatusCode::BadRequest)?;
        let remainder = &raw[split + HEADER_TERMINATOR.len()..];

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        self.parse_request_line(request_line)?;

        for line in lines {
            let (name, value) = line.split_once(": ").ok_or_else(|| {
                debug!(line, "header line without `: ` separator");
                StatusCode::BadRequest
            })?;
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(StatusCode::BadRequest);
            }
            self.headers.insert_unique(name, value).map_err(|e| {
                debug!(error = %e, "rejecting request");
                StatusCode::BadRequest
            })?;
        }

        let config = self.resolve_virtual_host(configs)?;

        if let Some(length) = self.headers.get("Content-Length") {
            let length: usize = length.trim().parse().map_err(|_| StatusCode::BadRequest)?;
            if length > config.client_max_body_size {
                debug!(
                    length,
                    limit = config.client_max_body_size,
                    "request body exceeds client_max_body_size"
                );
                return Err(StatusCode::PayloadTooLarge);
            }
            self.bytes_to_read = length;
            self.body.reserve(length.min(MAX_BODY_RESERVE));
        }

        self.push_body(remainder)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), StatusCode> {
        let (token, rest) = line.split_once(' ').ok_or(StatusCode::BadRequest)?;

        let method = Method::from_token(token);
        self.method = Some(method);
        if method == Method::Unknown {
            debug!(token, "unknown request method");
            return Err(StatusCode::BadRequest);
        }

        let target = rest
            .strip_suffix(" HTTP/1.1")
            .ok_or(StatusCode::BadRequest)?;
        if !target.starts_with('/') || target.contains(' ') {
            return Err(StatusCode::BadRequest);
        }

        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        if path.is_empty() {
            return Err(StatusCode::BadRequest);
        }
        let path = percent_decode_str(path).decode_utf8().map_err(|_| {
            debug!(path, "request path is not UTF-8 once decoded");
            StatusCode::BadRequest
        })?;
        if path.contains('\0') {
            return Err(StatusCode::BadRequest);
        }
        self.path = path.into_owned();
        self.query = query.to_owned();
        Ok(())
    }

    // Picks the server block for this request among those bound to the
    // connection's listen. Unmatched hosts fall back to the first block.
    fn resolve_virtual_host(
        &mut self,
        configs: &[Arc<ServerConfig>],
    ) -> Result<Arc<ServerConfig>, StatusCode> {
        let candidates: Vec<&Arc<ServerConfig>> = configs
            .iter()
            .filter(|config| config.listens.contains(&self.listen))
            .collect();
        let first = candidates.first().ok_or(StatusCode::NotFound)?;

        let host = self.headers.get("Host").ok_or(StatusCode::BadRequest)?;
        let host = host.split_once(':').map_or(host, |(name, _)| name);

        let (config, server_name) = match candidates
            .iter()
            .find(|config| config.server_names.contains(host))
        {
            Some(config) => (Arc::clone(config), host.to_owned()),
            None => (
                Arc::clone(first),
                first.first_server_name().to_owned(),
            ),
        };

        self.server_name = server_name;
        self.server_config = Some(Arc::clone(&config));
        Ok(config)
    }

    fn push_body(&mut self, chunk: &[u8]) -> Result<(), StatusCode> {
        if chunk.len() > self.bytes_to_read {
            debug!(
                received = chunk.len(),
                expected = self.bytes_to_read,
                "body overruns Content-Length"
            );
            return Err(StatusCode::BadRequest);
        }
        self.body.extend_from_slice(chunk);
        self.bytes_to_read -= chunk.len();
        Ok(())
    }

    fn fail(&mut self, status: StatusCode) {
        if self.status.is_none() {
            debug!(peer = %self.client, status = status.as_u16(), "request failed");
            self.status = Some(status);
        }
    }

    /// Writes every file part of the multipart body into `dir`.
    ///
    /// Plain form fields are skipped. The first malformed part stops
    /// extraction with `400`; a failed write stops it with `500`. Either way
    /// the status is also recorded on the request itself.
    pub fn write_files(&mut self, dir: &Path) -> Result<(), StatusCode> {
        let result = self.extract_files(dir);
        if let Err(status) = result {
            self.fail(status);
        }
        result
    }

    fn extract_files(&mut self, dir: &Path) -> Result<(), StatusCode> {
        let boundary = self
            .boundary()
            .ok_or(StatusCode::BadRequest)?
            .to_owned();

        for part in Parts::new(&self.body, &boundary) {
            let part = part.map_err(|e| {
                warn!(peer = %self.client, error = %e, "malformed multipart body");
                StatusCode::BadRequest
            })?;
            let Some(filename) = part.filename else {
                continue;
            };

            let destination = dir.join(filename);
            fs::write(&destination, part.content).map_err(|e| {
                warn!(path = %destination.display(), error = %e, "upload write failed");
                StatusCode::InternalServerError
            })?;
            debug!(path = %destination.display(), size = part.content.len(), "stored upload");
            self.uploaded_files.push(filename.to_owned());
        }
        Ok(())
    }

    /// Returns `true` once the header block has been parsed (or rejected).
    pub fn is_initialized(&self) -> bool {
        self.method.is_some()
    }

    /// Returns `true` when the request is ready for response generation.
    pub fn is_complete(&self) -> bool {
        self.status.is_some() || (self.is_initialized() && self.bytes_to_read == 0)
    }

    /// The terminal error status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn listen(&self) -> &Listen {
        &self.listen
    }

    /// The request method; [`Method::Unknown`] before initialization.
    pub fn method(&self) -> Method {
        self.method.unwrap_or(Method::Unknown)
    }

    /// The percent-decoded request path, without the query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query string without the leading `?`, still percent-encoded;
    /// empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body bytes still expected according to `Content-Length`.
    pub fn bytes_to_read(&self) -> usize {
        self.bytes_to_read
    }

    /// The host name the request was resolved to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The server block selected by the `Host` header.
    pub fn server_config(&self) -> Option<&Arc<ServerConfig>> {
        self.server_config.as_ref()
    }

    /// Names of the files written by [`write_files`](Self::write_files).
    pub fn uploaded_files(&self) -> &[String] {
        &self.uploaded_files
    }

    /// Looks up a cookie by name in the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get("Cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn is_multipart(&self) -> bool {
        self.headers
            .get("Content-Type")
            .is_some_and(|ct| ct.contains("multipart/form-data"))
    }

    /// The multipart boundary token, if the body is `multipart/form-data`.
    pub fn boundary(&self) -> Option<&str> {
        if !self.is_multipart() {
            return None;
        }
        self.headers.get("Content-Type").and_then(multipart::boundary)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
