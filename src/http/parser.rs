use bytes::{Bytes, BytesMut};

use crate::http::request::Version;

/// Maximum number of header fields accepted in one request head.
pub const MAX_HEADERS: usize = 100;

/// Maximum size of a request head (request line plus header block).
pub const MAX_HEAD_LENGTH: usize = 64 * 1024;

/// Default ceiling for a fully buffered request body.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 8 * 1024 * 1024;

/// Longest chunk-size or trailer line tolerated before giving up.
const MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    InvalidHead(#[from] httparse::Error),
    #[error("request head exceeds {MAX_HEAD_LENGTH} bytes")]
    HeadTooLarge,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("invalid chunk framing")]
    InvalidChunk,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
    #[error("parser is in an unrecoverable state")]
    Poisoned,
}

/// A complete request as reported by a [`MessageParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: Version,
    /// Header fields in wire order, duplicates included.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Incremental HTTP/1.x request parser.
///
/// One instance is bound to a connection. `execute` may be handed the same
/// unconsumed bytes repeatedly; it reports how many it took and must stop at
/// the end of the current message so pipelined requests stay buffered.
/// Incomplete input is not an error.
pub trait MessageParser: Send + 'static {
    /// Consumes a prefix of `input`, returning its length.
    fn execute(&mut self, input: &[u8]) -> Result<usize, ParseError>;

    /// True once a whole message (head and declared body) has been consumed.
    fn is_complete(&self) -> bool;

    /// Hands out the completed message. Returns `None` until `is_complete`.
    fn take_result(&mut self) -> Option<ParsedRequest>;

    /// Prepares for the next message on the same connection.
    ///
    /// Fails when the parser cannot be reused; callers must discard it.
    fn reset(&mut self) -> Result<(), ParseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
    Failed,
}

#[derive(Debug, Default)]
struct Head {
    method: String,
    target: String,
    version: Version,
    headers: Vec<(String, String)>,
}

/// Default [`MessageParser`] built on `httparse`.
///
/// Supports `Content-Length` and `chunked` request bodies. Chunk extensions
/// and trailer fields are consumed and dropped. Any token is accepted as a
/// method.
#[derive(Debug)]
pub struct Http1Parser {
    state: State,
    head: Option<Head>,
    body: BytesMut,
    max_body_size: u64,
    /// Bytes of the pending head already searched for a line break.
    head_scanned: usize,
    /// Head length at the last full parse attempt; 0 before the first.
    head_attempted: usize,
}

impl Default for Http1Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Http1Parser {
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_max_body_size(max_body_size: u64) -> Self {
        Self {
            state: State::Head,
            head: None,
            body: BytesMut::new(),
            max_body_size,
            head_scanned: 0,
            head_attempted: 0,
        }
    }

    fn fail(&mut self, err: ParseError) -> ParseError {
        self.state = State::Failed;
        err
    }

    /// Whether `buf` has grown enough since the last attempt to be worth
    /// parsing again.
    ///
    /// A head arriving in small pieces is only re-parsed when a new line
    /// ends or its length doubles, so the work stays linear in its size.
    fn head_ready(&mut self, buf: &[u8]) -> bool {
        let start = self.head_scanned.min(buf.len());
        let new_line = buf[start..].contains(&b'\n');
        self.head_scanned = buf.len();

        self.head_attempted == 0
            || new_line
            || buf.len() >= self.head_attempted.saturating_mul(2)
            || buf.len() > MAX_HEAD_LENGTH
    }

    /// Parses the head out of `buf`; `Ok(None)` means more bytes are needed.
    fn parse_head(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        if buf.is_empty() || !self.head_ready(buf) {
            return Ok(None);
        }
        self.head_attempted = buf.len();

        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut fields);

        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_LENGTH {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok(None);
            }
        };

        if len > MAX_HEAD_LENGTH {
            return Err(ParseError::HeadTooLarge);
        }
        self.head_scanned = 0;
        self.head_attempted = 0;

        let headers: Vec<(String, String)> = req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        self.state = body_state(&headers)?;
        if let State::Body { remaining } = self.state {
            if remaining > self.max_body_size {
                return Err(ParseError::BodyTooLarge);
            }
        }

        self.head = Some(Head {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: Version::new(1, req.version.unwrap_or(1)),
            headers,
        });

        Ok(Some(len))
    }

    fn take_body(&mut self, buf: &[u8], remaining: u64) -> Result<usize, ParseError> {
        let take = (buf.len() as u64).min(remaining) as usize;
        if self.body.len() as u64 + take as u64 > self.max_body_size {
            return Err(ParseError::BodyTooLarge);
        }
        self.body.extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn step(&mut self, input: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;

        loop {
            let buf = &input[consumed..];

            match self.state {
                State::Head => match self.parse_head(buf)? {
                    Some(len) => consumed += len,
                    None => return Ok(consumed),
                },

                State::Body { remaining: 0 } => self.state = State::Complete,

                State::Body { remaining } => {
                    if buf.is_empty() {
                        return Ok(consumed);
                    }
                    let took = self.take_body(buf, remaining)?;
                    consumed += took;
                    self.state = State::Body {
                        remaining: remaining - took as u64,
                    };
                }

                State::ChunkSize => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((len, 0))) => {
                        consumed += len;
                        self.state = State::Trailers;
                    }
                    Ok(httparse::Status::Complete((len, size))) => {
                        consumed += len;
                        self.state = State::ChunkData { remaining: size };
                    }
                    Ok(httparse::Status::Partial) => {
                        if buf.len() > MAX_LINE_LENGTH {
                            return Err(ParseError::InvalidChunk);
                        }
                        return Ok(consumed);
                    }
                    Err(_) => return Err(ParseError::InvalidChunk),
                },

                State::ChunkData { remaining: 0 } => self.state = State::ChunkDataEnd,

                State::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(consumed);
                    }
                    let took = self.take_body(buf, remaining)?;
                    consumed += took;
                    self.state = State::ChunkData {
                        remaining: remaining - took as u64,
                    };
                }

                State::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(consumed);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    consumed += 2;
                    self.state = State::ChunkSize;
                }

                State::Trailers => match find_crlf(buf) {
                    Some(0) => {
                        consumed += 2;
                        self.state = State::Complete;
                    }
                    Some(pos) => consumed += pos + 2,
                    None => {
                        if buf.len() > MAX_LINE_LENGTH {
                            return Err(ParseError::InvalidChunk);
                        }
                        return Ok(consumed);
                    }
                },

                State::Complete => return Ok(consumed),

                State::Failed => return Err(ParseError::Poisoned),
            }
        }
    }
}

impl MessageParser for Http1Parser {
    fn execute(&mut self, input: &[u8]) -> Result<usize, ParseError> {
        self.step(input).map_err(|e| match e {
            ParseError::Poisoned => e,
            other => self.fail(other),
        })
    }

    fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    fn take_result(&mut self) -> Option<ParsedRequest> {
        if self.state != State::Complete {
            return None;
        }
        let head = self.head.take()?;
        Some(ParsedRequest {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body: self.body.split().freeze(),
        })
    }

    fn reset(&mut self) -> Result<(), ParseError> {
        if self.state == State::Failed {
            return Err(ParseError::Poisoned);
        }
        self.state = State::Head;
        self.head = None;
        self.body.clear();
        self.head_scanned = 0;
        self.head_attempted = 0;
        Ok(())
    }
}

/// Chooses how the body is framed from the request headers.
fn body_state(headers: &[(String, String)]) -> Result<State, ParseError> {
    let mut content_length: Option<u64> = None;
    let mut transfer_encoding: Option<&str> = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let len: u64 = value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if content_length.is_some_and(|prev| prev != len) {
                return Err(ParseError::InvalidContentLength);
            }
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding = Some(value);
        }
    }

    match (transfer_encoding, content_length) {
        (Some(_), Some(_)) => Err(ParseError::InvalidContentLength),
        (Some(te), None) => {
            let last = te.rsplit(',').next().map(str::trim).unwrap_or_default();
            if last.eq_ignore_ascii_case("chunked") {
                Ok(State::ChunkSize)
            } else {
                Err(ParseError::InvalidTransferEncoding)
            }
        }
        (None, Some(len)) => Ok(State::Body { remaining: len }),
        (None, None) => Ok(State::Body { remaining: 0 }),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
