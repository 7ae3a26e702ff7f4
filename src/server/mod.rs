//! Listening socket, accept loop and server-wide policy.

pub mod hint;
pub mod listener;
pub mod registry;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::http::connection::ConnectionLimits;
use crate::http::dispatcher::{App, Handler};
use crate::pool::{PoolLimits, PoolStats, ResourcePool};
use hint::{MemoryHint, MemoryHintOptions};
use registry::ConnectionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tuning knobs for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
    /// Live connection ceiling; 0 means unlimited.
    pub max_connections: usize,
    /// Inactivity timeout; zero disables it.
    pub timeout: Duration,
    /// Requests served per connection before it is closed; 0 means no cap.
    pub max_requests_per_connection: usize,
    pub batch_size: usize,
    pub read_buffer_size: usize,
    /// How long `close` waits for connections before aborting them.
    pub close_grace: Duration,
    pub pool: PoolLimits,
    pub memory_hint: MemoryHintOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: 511,
            max_connections: 0,
            timeout: Duration::from_secs(120),
            max_requests_per_connection: 1000,
            batch_size: 16,
            read_buffer_size: 16 * 1024,
            close_grace: Duration::from_secs(5),
            pool: PoolLimits::default(),
            memory_hint: MemoryHintOptions::default(),
        }
    }
}

enum State {
    Idle,
    /// A `listen` call is binding; others wait on `Shared::bound`.
    Binding,
    Listening {
        addr: SocketAddr,
        accept: JoinHandle<()>,
    },
    Closing,
    Closed,
}

/// Everything the accept loop and connection tasks share with the handle.
pub(crate) struct Shared {
    pub(crate) app: Arc<App>,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) limits: Arc<ConnectionLimits>,
    pub(crate) max_connections: AtomicUsize,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) hint: MemoryHint,
    pub(crate) next_id: AtomicU64,
    pub(crate) shutdown: watch::Sender<bool>,
    backlog: u32,
    close_grace: Duration,
    state: Mutex<State>,
    bound: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An HTTP/1.x server.
///
/// Cloning yields another handle to the same server. Dropping the handles
/// does not stop a listening server; call [`close`](Self::close).
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

/// Creates a server with default options around `handler`.
///
/// ```no_run
/// use ferry::create_server;
/// use ferry::http::request::IncomingMessage;
/// use ferry::http::response::ServerResponse;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let server = create_server(|req: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
///     res.set_header("Content-Type", "text/plain")?;
///     res.end_with(format!("you asked for {}", req.target()));
///     Ok(())
/// });
/// let addr = server.listen("127.0.0.1:8080").await?;
/// println!("listening on {addr}");
/// # Ok(())
/// # }
/// ```
pub fn create_server<H: Handler>(handler: H) -> Server {
    Server::new(handler)
}

impl Server {
    pub fn new<H: Handler>(handler: H) -> Self {
        Self::with_options(ServerOptions::default(), handler)
    }

    pub fn with_options<H: Handler>(options: ServerOptions, handler: H) -> Self {
        let limits = ConnectionLimits::new(
            options.timeout,
            options.max_requests_per_connection,
            options.batch_size,
            options.read_buffer_size,
        );
        let (shutdown, _) = watch::channel(false);

        let shared = Shared {
            app: Arc::new(App::new(Arc::new(handler))),
            pool: Arc::new(ResourcePool::new(options.pool)),
            limits: Arc::new(limits),
            max_connections: AtomicUsize::new(options.max_connections),
            registry: Arc::new(ConnectionRegistry::new()),
            hint: MemoryHint::new(options.memory_hint),
            next_id: AtomicU64::new(1),
            shutdown,
            backlog: options.backlog,
            close_grace: options.close_grace,
            state: Mutex::new(State::Idle),
            bound: Notify::new(),
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Binds `addr` and starts accepting, using the configured backlog.
    ///
    /// Returns the bound address, which tells the real port when `addr`
    /// asked for port 0. Calling it on a listening server returns the
    /// existing address; a call made while another is still binding waits
    /// for it and returns the same address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, ServerError> {
        self.listen_with_backlog(addr, self.shared.backlog).await
    }

    pub async fn listen_with_backlog(
        &self,
        addr: &str,
        backlog: u32,
    ) -> Result<SocketAddr, ServerError> {
        if let Some(bound) = self.claim_listen().await? {
            return Ok(bound);
        }

        let bound = match bind(addr, backlog).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.release_claim();
                return Err(ServerError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };

        let mut state = self.shared.state();
        if !matches!(*state, State::Binding) {
            // Closed while binding; the listener is dropped unused.
            drop(state);
            self.shared.bound.notify_waiters();
            return Err(ServerError::AlreadyClosed);
        }

        let accept = tokio::spawn(listener::run(
            listener,
            self.shared.clone(),
            self.shared.shutdown.subscribe(),
        ));
        *state = State::Listening {
            addr: local,
            accept,
        };
        drop(state);
        self.shared.bound.notify_waiters();

        info!(addr = %local, backlog, "listening");
        Ok(local)
    }

    /// Moves `Idle` to `Binding`, returning `None` when the caller should
    /// bind. Waits out a concurrent bind and reports its address instead.
    async fn claim_listen(&self) -> Result<Option<SocketAddr>, ServerError> {
        loop {
            let notified = self.shared.bound.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state();
                match *state {
                    State::Idle => {
                        *state = State::Binding;
                        return Ok(None);
                    }
                    State::Listening { addr, .. } => return Ok(Some(addr)),
                    State::Closing | State::Closed => return Err(ServerError::AlreadyClosed),
                    State::Binding => {}
                }
            }

            notified.await;
        }
    }

    /// Gives up a failed bind so another `listen` may try.
    fn release_claim(&self) {
        {
            let mut state = self.shared.state();
            if matches!(*state, State::Binding) {
                *state = State::Idle;
            }
        }
        self.shared.bound.notify_waiters();
    }

    /// Stops accepting and closes every live connection.
    ///
    /// Idle connections close at once; busy ones finish their current write
    /// first. Whatever is still open after the grace period is aborted.
    /// A no-op on a server that never started listening; a `listen` still
    /// binding fails with [`ServerError::AlreadyClosed`].
    pub async fn close(&self) {
        let accept = {
            let mut state = self.shared.state();
            match std::mem::replace(&mut *state, State::Closing) {
                State::Listening { accept, .. } => accept,
                State::Binding => {
                    // The pending `listen` sees this and drops its listener.
                    *state = State::Closed;
                    return;
                }
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        info!(connections = self.connections(), "server closing");
        self.shared.shutdown.send_replace(true);
        // The accept loop watches the same signal; awaiting it drops the listener.
        let _ = accept.await;

        let registry = &self.shared.registry;
        if tokio::time::timeout(self.shared.close_grace, registry.wait_empty())
            .await
            .is_err()
        {
            let aborted = registry.abort_all();
            warn!(aborted, "close grace period elapsed, aborting connections");
        }

        *self.shared.state() = State::Closed;
        info!("server closed");
    }

    /// Registers an observer run before the handler for every request.
    ///
    /// Observers get the same failure boundary as the handler: an error or
    /// panic is logged and answered with a 500 if nothing was sent yet.
    pub fn on_request<H: Handler>(&self, observer: H) {
        self.shared.app.observe(Arc::new(observer));
    }

    /// The bound address while listening.
    pub fn address(&self) -> Option<SocketAddr> {
        match &*self.shared.state() {
            State::Listening { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections.load(Ordering::Relaxed)
    }

    /// Sets the live connection ceiling; 0 means unlimited.
    ///
    /// Only affects connections accepted afterwards.
    pub fn set_max_connections(&self, max: usize) {
        self.shared.max_connections.store(max, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.limits.timeout()
    }

    /// Sets the inactivity timeout for all connections; zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.limits.set_timeout(timeout);
    }

    pub fn max_requests_per_connection(&self) -> usize {
        self.shared.limits.max_requests()
    }

    pub fn set_max_requests_per_connection(&self, max: usize) {
        self.shared.limits.set_max_requests(max);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }
}

/// Resolves `addr` and binds the first address that accepts a listener.
async fn bind(addr: &str, backlog: u32) -> io::Result<TcpListener> {
    let mut last_err = None;

    for candidate in tokio::net::lookup_host(addr).await? {
        let socket = if candidate.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;

        if let Err(e) = socket.bind(candidate) {
            last_err = Some(e);
            continue;
        }
        match socket.listen(backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}
