use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::http::headers::{self, Headers};
use crate::http::request::ConnectionInfo;
use crate::http::writer;

/// HTTP status codes with a known reason phrase.
///
/// Responses carry a raw `u16`, so codes outside this list are still
/// allowed; they just need an explicit reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 100 Continue
    Continue,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 202 Accepted
    Accepted,
    /// 204 No Content
    NoContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found
    Found,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 408 Request Timeout
    RequestTimeout,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 504 Gateway Timeout
    GatewayTimeout,
}

const ALL_STATUS_CODES: [StatusCode; 20] = [
    StatusCode::Continue,
    StatusCode::Ok,
    StatusCode::Created,
    StatusCode::Accepted,
    StatusCode::NoContent,
    StatusCode::MovedPermanently,
    StatusCode::Found,
    StatusCode::NotModified,
    StatusCode::BadRequest,
    StatusCode::Unauthorized,
    StatusCode::Forbidden,
    StatusCode::NotFound,
    StatusCode::MethodNotAllowed,
    StatusCode::RequestTimeout,
    StatusCode::PayloadTooLarge,
    StatusCode::InternalServerError,
    StatusCode::NotImplemented,
    StatusCode::BadGateway,
    StatusCode::ServiceUnavailable,
    StatusCode::GatewayTimeout,
];

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use ferry::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// ```
    /// # use ferry::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::Accepted => "Accepted",
            StatusCode::NoContent => "No Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::Found => "Found",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::GatewayTimeout => "Gateway Timeout",
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        ALL_STATUS_CODES.into_iter().find(|s| s.as_u16() == code)
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status.as_u16()
    }
}

/// Reason phrase for `code`, or `"Unknown"` when it has none on record.
pub fn canonical_reason(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .map(|s| s.reason_phrase())
        .unwrap_or("Unknown")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("headers already sent")]
    HeadersSent,
    #[error("response already finished")]
    Finished,
    #[error("invalid header field")]
    InvalidHeader,
    #[error("invalid reason phrase")]
    InvalidReason,
}

/// Lifecycle of a [`ServerResponse`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseState {
    /// Status and headers may still change.
    Init,
    /// Head is fixed; body writes are still accepted.
    HeadersSent,
    /// Serialized; nothing more may be written.
    Finished,
}

/// Completion callback attached to a write or to `end`.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The outbound half of an exchange.
///
/// Body fragments are buffered until [`end`](Self::end), which serializes
/// status line, headers and body into one contiguous buffer exactly once.
/// The connection picks that buffer up and writes it to the transport.
pub struct ServerResponse {
    status: u16,
    reason: Option<String>,
    headers: Headers,
    chunks: Vec<Bytes>,
    body_len: usize,
    state: ResponseState,
    keep_alive: bool,
    outgoing: Option<Bytes>,
    deferred: Vec<Callback>,
    connection: Option<Arc<ConnectionInfo>>,
}

impl fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body_len)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Default for ServerResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerResponse {
    pub fn new() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: Headers::new(),
            chunks: Vec::new(),
            body_len: 0,
            state: ResponseState::Init,
            keep_alive: true,
            outgoing: None,
            deferred: Vec::new(),
            connection: None,
        }
    }

    /// Attaches a freshly acquired response to its exchange.
    pub(crate) fn bind(&mut self, connection: Option<Arc<ConnectionInfo>>, keep_alive: bool) {
        self.connection = connection;
        self.keep_alive = keep_alive;
    }

    /// Returns every field to its initial value, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.status = 200;
        self.reason = None;
        self.headers.clear();
        self.chunks.clear();
        self.body_len = 0;
        self.state = ResponseState::Init;
        self.keep_alive = true;
        self.outgoing = None;
        self.deferred.clear();
        self.connection = None;
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn headers_sent(&self) -> bool {
        self.state >= ResponseState::HeadersSent
    }

    pub fn finished(&self) -> bool {
        self.state == ResponseState::Finished
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn status_message(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| canonical_reason(self.status))
    }

    /// Whether the connection stays open after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Cumulative length of the body written so far.
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// The connection this response will be written to, while attached.
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_deref()
    }

    fn ensure_head_mutable(&self) -> Result<(), ResponseError> {
        if self.headers_sent() {
            return Err(ResponseError::HeadersSent);
        }
        Ok(())
    }

    fn check_field(name: &str, value: &str) -> Result<(), ResponseError> {
        if headers::is_valid_name(name) && headers::is_valid_value(value) {
            Ok(())
        } else {
            Err(ResponseError::InvalidHeader)
        }
    }

    pub fn set_status(&mut self, status: impl Into<u16>) -> Result<&mut Self, ResponseError> {
        self.ensure_head_mutable()?;
        self.status = status.into();
        self.reason = None;
        Ok(self)
    }

    /// Sets a header, replacing any existing values of the same name.
    ///
    /// Fails with [`ResponseError::InvalidHeader`] when the name is not a
    /// token or the value contains CR, LF or NUL.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Result<&mut Self, ResponseError> {
        self.ensure_head_mutable()?;
        let (name, value): (String, String) = (name.into(), value.to_string());
        Self::check_field(&name, &value)?;
        self.headers.set(name, value);
        Ok(self)
    }

    /// Adds a header value alongside any existing ones (e.g. `Set-Cookie`).
    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Result<&mut Self, ResponseError> {
        self.ensure_head_mutable()?;
        let (name, value): (String, String) = (name.into(), value.to_string());
        Self::check_field(&name, &value)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn get_header(&self, name: &str) -> Result<Option<&str>, ResponseError> {
        self.ensure_head_mutable()?;
        Ok(self.headers.get(name))
    }

    pub fn remove_header(&mut self, name: &str) -> Result<Option<String>, ResponseError> {
        self.ensure_head_mutable()?;
        Ok(self.headers.remove(name))
    }

    /// Fixes status and reason phrase and marks the head as sent.
    ///
    /// `reason` falls back to the canonical phrase for `status`.
    pub fn write_head(&mut self, status: u16, reason: Option<&str>) -> Result<&mut Self, ResponseError> {
        self.write_head_with_headers(status, reason, std::iter::empty::<(String, String)>())
    }

    /// Like [`write_head`](Self::write_head), setting `headers` first.
    pub fn write_head_with_headers<I, K, V>(
        &mut self,
        status: u16,
        reason: Option<&str>,
        headers: I,
    ) -> Result<&mut Self, ResponseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.ensure_head_mutable()?;
        if reason.is_some_and(|r| !headers::is_valid_value(r)) {
            return Err(ResponseError::InvalidReason);
        }
        let fields = headers
            .into_iter()
            .map(|(name, value)| {
                let (name, value): (String, String) = (name.into(), value.to_string());
                Self::check_field(&name, &value).map(|_| (name, value))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.status = status;
        self.reason = reason.map(str::to_string);
        for (name, value) in fields {
            self.headers.set(name, value);
        }
        self.state = ResponseState::HeadersSent;
        Ok(self)
    }

    /// Appends a body fragment.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        if self.finished() {
            return Err(ResponseError::Finished);
        }
        let chunk = chunk.into();
        self.body_len += chunk.len();
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(())
    }

    /// Appends a body fragment and runs `callback` once the current handler
    /// invocation has returned.
    pub fn write_with<F>(&mut self, chunk: impl Into<Bytes>, callback: F) -> Result<(), ResponseError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.write(chunk)?;
        self.deferred.push(Box::new(callback));
        Ok(())
    }

    /// Finishes the response. Calling it again is a no-op.
    pub fn end(&mut self) {
        if self.finished() {
            return;
        }
        self.finish();
    }

    /// Writes a final fragment and finishes the response.
    ///
    /// Ignored entirely when the response is already finished.
    pub fn end_with(&mut self, data: impl Into<Bytes>) {
        if self.finished() {
            return;
        }
        let data = data.into();
        self.body_len += data.len();
        if !data.is_empty() {
            self.chunks.push(data);
        }
        self.finish();
    }

    /// Finishes the response and defers `callback` like [`write_with`](Self::write_with).
    pub fn end_with_callback<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.finished() {
            return;
        }
        self.finish();
        self.deferred.push(Box::new(callback));
    }

    fn finish(&mut self) {
        self.prepare_head();
        self.state = ResponseState::Finished;

        let chunks = std::mem::take(&mut self.chunks);
        self.outgoing = Some(writer::serialize_response(
            self.status,
            self.status_message(),
            &self.headers,
            &chunks,
            self.body_len,
        ));
    }

    /// Fills in framing headers the handler left out.
    ///
    /// The body is fully buffered, so it is always framed by length; a
    /// handler-supplied `Transfer-Encoding` would leave it unframed.
    fn prepare_head(&mut self) {
        if self.headers.remove("Transfer-Encoding").is_some() {
            self.headers.remove("Content-Length");
        }
        if !self.headers.contains("Content-Length") && status_allows_body(self.status) {
            self.headers.set("Content-Length", self.body_len.to_string());
        }

        if self.headers.contains("Connection") {
            if self.headers.has_token("Connection", "close") {
                self.keep_alive = false;
            }
        } else if self.keep_alive {
            self.headers.set("Connection", "keep-alive");
        } else {
            self.headers.set("Connection", "close");
        }
    }

    /// Replaces whatever the handler produced with a bare 500, or closes out
    /// a response whose head was already fixed.
    pub(crate) fn fail_internal(&mut self) {
        match self.state {
            ResponseState::Init => {
                self.headers.clear();
                self.chunks.clear();
                self.body_len = 0;
                self.status = StatusCode::InternalServerError.as_u16();
                self.reason = None;
                self.headers.set("Content-Type", "text/plain");
                self.end_with(StatusCode::InternalServerError.reason_phrase());
            }
            ResponseState::HeadersSent => {
                self.keep_alive = false;
                self.headers.set("Connection", "close");
                self.finish();
            }
            ResponseState::Finished => {}
        }
    }

    /// The serialized response once finished, until the connection takes it.
    pub fn serialized(&self) -> Option<&[u8]> {
        self.outgoing.as_deref()
    }

    /// Takes the serialized wire bytes; yields them at most once.
    pub(crate) fn take_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.take()
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.deferred)
    }
}

fn status_allows_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}
