use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::http::headers::Headers;
use crate::http::parser::ParsedRequest;

/// HTTP request methods.
///
/// The common verbs get their own variant; any other token the parser
/// accepts is carried verbatim in `Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Method {
    /// GET - Retrieve a resource
    #[default]
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// Any other method token (e.g. `PURGE`)
    Extension(String),
}

impl Method {
    /// Parses an HTTP method token.
    ///
    /// Matching is case-sensitive, as method tokens are.
    ///
    /// ```
    /// # use ferry::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Method::GET);
    /// assert_eq!(Method::parse("get"), Method::Extension("get".into()));
    /// ```
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::Extension(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version as reported on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::HTTP_11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity of the transport connection an exchange arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server-assigned connection id, unique for the server's lifetime.
    pub id: u64,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

/// A fully received HTTP request.
///
/// Instances are recycled through the [`ResourcePool`](crate::pool::ResourcePool);
/// handlers only ever see them after the whole message, body included, has
/// been parsed.
#[derive(Debug, Default)]
pub struct IncomingMessage {
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    body: Bytes,
    connection: Option<Arc<ConnectionInfo>>,
}

impl IncomingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a standalone message from a parser result.
    pub fn from_parsed(parsed: ParsedRequest) -> Self {
        let mut msg = Self::new();
        msg.fill(parsed, None);
        msg
    }

    /// Populates this (reset) message from a parser result.
    ///
    /// Duplicate header names collapse to the last value received.
    pub(crate) fn fill(&mut self, parsed: ParsedRequest, connection: Option<Arc<ConnectionInfo>>) {
        self.method = Method::parse(&parsed.method);
        self.target = parsed.target;
        self.version = parsed.version;
        self.headers.clear();
        for (name, value) in parsed.headers {
            self.headers.set(name, value);
        }
        self.body = parsed.body;
        self.connection = connection;
    }

    /// Returns every field to its initial value, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.method = Method::default();
        self.target.clear();
        self.version = Version::default();
        self.headers.clear();
        self.body = Bytes::new();
        self.connection = None;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as sent (e.g. `/search?q=rust`).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Version in `major.minor` form, e.g. `"1.1"`.
    pub fn http_version(&self) -> String {
        self.version.to_string()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Retrieves a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// The connection this request arrived on, if still attached.
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_deref()
    }

    /// Resolves the target into an absolute URL using the `Host` header.
    ///
    /// Absolute-form targets are parsed as they are.
    pub fn url(&self) -> Result<url::Url, url::ParseError> {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            return url::Url::parse(&self.target);
        }
        let host = self.header("Host").unwrap_or("localhost");
        let base = url::Url::parse(&format!("http://{}/", host))?;
        base.join(&self.target)
    }
}
