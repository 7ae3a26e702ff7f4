use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::http::parser::{MessageParser, ParseError, ParsedRequest};
use crate::http::request::Version;
use crate::pool::ResourcePool;

/// How much of the pending buffer is kept on an [`AssembleError`].
const DIAGNOSTIC_PREFIX: usize = 256;

/// A completed request and whether its connection persists afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub request: ParsedRequest,
    pub keep_alive: bool,
}

/// The parser rejected the input. The connection cannot continue.
#[derive(Debug, thiserror::Error)]
#[error("{source} ({} bytes buffered)", buffered.len())]
pub struct AssembleError {
    #[source]
    pub source: ParseError,
    /// Leading bytes of the unconsumed input at the time of failure.
    pub buffered: Bytes,
}

/// Feeds raw reads into one connection's parser and surfaces whole requests.
///
/// Bytes the parser has not taken yet stay in a pending buffer, so a request
/// may arrive split across any number of reads, and several pipelined
/// requests may arrive in one.
pub struct Assembler {
    parser: Option<Box<dyn MessageParser>>,
    pending: BytesMut,
}

impl Assembler {
    pub fn new(parser: Box<dyn MessageParser>) -> Self {
        Self {
            parser: Some(parser),
            pending: BytesMut::new(),
        }
    }

    /// Appends `chunk` and lets the parser consume what it can.
    ///
    /// Returns the number of bytes consumed from the pending buffer.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<usize, AssembleError> {
        self.pending.extend_from_slice(chunk);
        self.resume()
    }

    /// Runs the parser over already buffered bytes.
    ///
    /// Used after [`reset`](Self::reset) to pick up pipelined requests that
    /// arrived with an earlier read.
    pub fn resume(&mut self) -> Result<usize, AssembleError> {
        let result = match self.parser.as_mut() {
            Some(parser) => parser.execute(&self.pending),
            None => Err(ParseError::Poisoned),
        };

        match result {
            Ok(consumed) => {
                self.pending.advance(consumed);
                Ok(consumed)
            }
            Err(source) => {
                let keep = self.pending.len().min(DIAGNOSTIC_PREFIX);
                Err(AssembleError {
                    source,
                    buffered: Bytes::copy_from_slice(&self.pending[..keep]),
                })
            }
        }
    }

    /// Takes the completed request, if the parser has one.
    pub fn poll_complete(&mut self) -> Option<Assembled> {
        let parser = self.parser.as_mut()?;
        if !parser.is_complete() {
            return None;
        }
        let request = parser.take_result()?;
        let keep_alive = keep_alive(
            request.version,
            request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        Some(Assembled {
            request,
            keep_alive,
        })
    }

    /// Readies the parser for the next request on this connection.
    ///
    /// A parser that cannot reset goes back through the pool, which discards
    /// it, and is replaced with a fresh one.
    pub fn reset(&mut self, pool: &ResourcePool) {
        let reset = match self.parser.as_mut() {
            Some(parser) => parser.reset(),
            None => Err(ParseError::Poisoned),
        };

        if let Err(e) = reset {
            debug!(error = %e, "parser reset failed, replacing it");
            if let Some(failed) = self.parser.take() {
                pool.release_parser(failed);
            }
            self.parser = Some(pool.acquire_parser());
        }
    }

    /// Bytes received but not yet consumed by the parser.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Detaches the parser so it can go back to the pool.
    pub fn take_parser(&mut self) -> Option<Box<dyn MessageParser>> {
        self.pending.clear();
        self.parser.take()
    }
}

/// Decides whether a connection persists after a request.
///
/// HTTP/1.1 persists unless `Connection` carries `close`; HTTP/1.0 persists
/// only with `Connection: keep-alive`; anything else closes.
///
/// ```
/// # use ferry::http::assembler::keep_alive;
/// # use ferry::http::request::Version;
/// assert!(keep_alive(Version::HTTP_11, []));
/// assert!(!keep_alive(Version::HTTP_10, []));
/// assert!(keep_alive(Version::HTTP_10, [("Connection", "Keep-Alive")]));
/// ```
pub fn keep_alive<'a, I>(version: Version, headers: I) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut close = false;
    let mut persist = false;

    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("connection") {
            continue;
        }
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                persist = true;
            }
        }
    }

    match version {
        Version::HTTP_11 => !close,
        Version::HTTP_10 => persist && !close,
        _ => false,
    }
}
