use std::future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::http::assembler::{AssembleError, Assembled, Assembler};
use crate::http::dispatcher::{App, BatchDispatcher, Exchange, Flush};
use crate::http::request::ConnectionInfo;
use crate::http::response::ServerResponse;
use crate::http::writer;
use crate::pool::ResourcePool;

/// Per-connection policy shared by every connection of a server.
///
/// Timeout and request cap can be changed while connections are running;
/// each connection reads the current value on every loop iteration.
#[derive(Debug)]
pub struct ConnectionLimits {
    timeout_ms: AtomicU64,
    max_requests: AtomicUsize,
    batch_size: usize,
    read_buffer_size: usize,
}

impl ConnectionLimits {
    pub fn new(
        timeout: Duration,
        max_requests: usize,
        batch_size: usize,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            max_requests: AtomicUsize::new(max_requests),
            batch_size: batch_size.max(1),
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    /// Inactivity timeout; `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Sets the inactivity timeout. Zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Requests served per connection before it is closed; 0 means no cap.
    pub fn max_requests(&self) -> usize {
        self.max_requests.load(Ordering::Relaxed)
    }

    pub fn set_max_requests(&self, max: usize) {
        self.max_requests.store(max, Ordering::Relaxed);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new(Duration::from_secs(120), 1000, 16, 16 * 1024)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for bytes from the peer.
    Reading,
    /// A handler left its response unfinished; nothing more is dispatched
    /// or written until the inactivity timeout, peer EOF or server shutdown.
    Stalled,
    /// Finishing up; the transport is about to be closed.
    Closing,
    /// Torn down.
    Closed,
}

type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Owns one accepted transport from first read to close.
///
/// ```text
///  Reading ──(request complete)──► dispatch ──(keep-alive)──► Reading
///     │                              │
///     │ EOF / timeout / shutdown     ├─(close, cap reached)──► Closing ──► Closed
///     │                              └─(response left open)──► Stalled ──► Closing
///     └──────────────────────────────────────────────────────► Closing
/// ```
///
/// Requests are dispatched and answered strictly in arrival order. Teardown
/// runs exactly once, whether the loop ends normally, fails, or the task is
/// dropped.
pub struct Connection<S> {
    stream: S,
    info: Arc<ConnectionInfo>,
    assembler: Assembler,
    dispatcher: BatchDispatcher,
    app: Arc<App>,
    pool: Arc<ResourcePool>,
    limits: Arc<ConnectionLimits>,
    shutdown: Option<watch::Receiver<bool>>,
    requests: u64,
    last_activity: Instant,
    state: ConnectionState,
    stalled: Vec<ServerResponse>,
    on_close: Option<CloseHook>,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        info: ConnectionInfo,
        app: Arc<App>,
        pool: Arc<ResourcePool>,
        limits: Arc<ConnectionLimits>,
    ) -> Self {
        let assembler = Assembler::new(pool.acquire_parser());
        let dispatcher = BatchDispatcher::new(limits.batch_size());

        Self {
            stream,
            info: Arc::new(info),
            assembler,
            dispatcher,
            app,
            pool,
            limits,
            shutdown: None,
            requests: 0,
            last_activity: Instant::now(),
            state: ConnectionState::Reading,
            stalled: Vec::new(),
            on_close: None,
            closed: false,
        }
    }

    /// Stops reading and closes once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Runs `hook` during teardown.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Drives the connection until it closes.
    ///
    /// Only transport failures are reported; malformed input, timeouts and
    /// request caps are ordinary ways for a connection to end.
    pub async fn run(mut self) -> io::Result<()> {
        let result = self.drive().await;

        if result.is_ok() {
            // Peer may already be gone; nothing useful to do on failure.
            let _ = self.stream.shutdown().await;
        }
        self.teardown();

        result
    }

    async fn drive(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; self.limits.read_buffer_size()];

        loop {
            match self.state {
                ConnectionState::Reading => self.read_step(&mut buf).await?,

                ConnectionState::Stalled => self.stall_step(&mut buf).await?,

                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
            }
        }
    }

    async fn read_step(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let timeout = self.limits.timeout();

        let n = tokio::select! {
            read = self.stream.read(buf) => read?,
            _ = idle_deadline(self.last_activity, timeout) => {
                debug!(conn = self.info.id, "idle timeout");
                self.state = ConnectionState::Closing;
                return Ok(());
            }
            _ = shutdown_requested(&mut self.shutdown) => {
                trace!(conn = self.info.id, "closing for server shutdown");
                self.state = ConnectionState::Closing;
                return Ok(());
            }
        };

        if n == 0 {
            trace!(conn = self.info.id, "peer closed connection");
            self.state = ConnectionState::Closing;
            return Ok(());
        }

        self.last_activity = Instant::now();

        let fed = self.assembler.feed(&buf[..n]);
        self.process(fed.map(|_| ())).await
    }

    /// Waits out a stalled connection. Bytes that arrive meanwhile can never
    /// be answered in order, so they are dropped.
    async fn stall_step(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let timeout = self.limits.timeout();

        tokio::select! {
            read = self.stream.read(buf) => {
                if read? > 0 {
                    return Ok(());
                }
                trace!(conn = self.info.id, "peer closed stalled connection");
            }
            _ = idle_deadline(self.last_activity, timeout) => {
                debug!(conn = self.info.id, "closing stalled connection after timeout");
            }
            _ = shutdown_requested(&mut self.shutdown) => {}
        }

        self.state = ConnectionState::Closing;
        Ok(())
    }

    /// Dispatches every request the assembler has completed.
    async fn process(&mut self, mut parsed: Result<(), AssembleError>) -> io::Result<()> {
        loop {
            if let Err(e) = parsed {
                debug!(
                    conn = self.info.id,
                    error = %e,
                    buffered = ?String::from_utf8_lossy(&e.buffered),
                    "HTTP parse error"
                );
                self.flush().await?;
                self.close_unless_stalled();
                return Ok(());
            }

            let Some(Assembled {
                request,
                keep_alive,
            }) = self.assembler.poll_complete()
            else {
                break;
            };

            self.requests += 1;
            let cap = self.limits.max_requests();
            let at_cap = cap > 0 && self.requests >= cap as u64;
            let keep_alive = keep_alive && !at_cap && !self.draining();

            trace!(
                conn = self.info.id,
                method = %request.method,
                path = %request.target,
                request = self.requests,
                keep_alive,
                "request complete"
            );

            let mut message = self.pool.acquire_message();
            message.fill(request, Some(self.info.clone()));
            let mut response = self.pool.acquire_response();
            response.bind(Some(self.info.clone()), keep_alive);

            let flush = self.dispatcher.push(Exchange {
                request: message,
                response,
            });

            if !keep_alive {
                if at_cap {
                    debug!(conn = self.info.id, requests = self.requests, "request cap reached");
                }
                self.flush().await?;
                self.close_unless_stalled();
                return Ok(());
            }

            if flush == Flush::Now {
                self.flush().await?;
                if self.state != ConnectionState::Reading {
                    return Ok(());
                }
            }

            self.assembler.reset(&self.pool);
            parsed = self.assembler.resume().map(|_| ());
        }

        if !self.dispatcher.is_empty() {
            tokio::task::yield_now().await;
            self.flush().await?;
        }

        Ok(())
    }

    /// Runs the application over queued exchanges and writes the finished
    /// responses in order.
    async fn flush(&mut self) -> io::Result<()> {
        let responses = self.dispatcher.flush(&self.app, &self.pool);
        let mut responses = responses.into_iter();

        while let Some(mut response) = responses.next() {
            if !self.stalled.is_empty() || !response.finished() {
                if self.stalled.is_empty() {
                    warn!(
                        conn = self.info.id,
                        "handler returned without ending the response; holding connection"
                    );
                }
                self.stalled.push(response);
                self.state = ConnectionState::Stalled;
                continue;
            }

            let keep_alive = response.keep_alive();
            let written = match response.take_outgoing() {
                Some(bytes) => writer::write_response(&mut self.stream, &bytes).await,
                None => Ok(()),
            };
            self.pool.release_response(response);

            if let Err(e) = written {
                self.state = ConnectionState::Closing;
                responses.for_each(|r| self.pool.release_response(r));
                return Err(e);
            }

            if !keep_alive {
                self.state = ConnectionState::Closing;
                responses.for_each(|r| self.pool.release_response(r));
                return Ok(());
            }
        }

        Ok(())
    }

    fn close_unless_stalled(&mut self) {
        if self.state != ConnectionState::Stalled {
            self.state = ConnectionState::Closing;
        }
    }

    fn draining(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

impl<S> Connection<S> {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Releases everything the connection holds. Safe to call repeatedly.
    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = ConnectionState::Closed;

        self.dispatcher.discard(&self.pool);
        for response in self.stalled.drain(..) {
            self.pool.release_response(response);
        }
        if let Some(parser) = self.assembler.take_parser() {
            self.pool.release_parser(parser);
        }
        if let Some(hook) = self.on_close.take() {
            hook();
        }

        debug!(conn = self.info.id, requests = self.requests, "connection closed");
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolves once the connection has been idle for `timeout`.
async fn idle_deadline(last_activity: Instant, timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep_until(last_activity + timeout).await,
        None => future::pending().await,
    }
}

/// Resolves once the server asks connections to close.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let sender_gone = rx.wait_for(|closing| *closing).await.is_err();
            if sender_gone {
                future::pending::<()>().await;
            }
        }
        None => future::pending().await,
    }
}
