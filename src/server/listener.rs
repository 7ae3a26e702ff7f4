use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::http::connection::Connection;
use crate::http::request::ConnectionInfo;
use crate::http::writer::is_benign_disconnect;
use crate::server::Shared;

/// Pause after an unexpected accept failure (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections until `shutdown` turns `true`.
pub(crate) async fn run(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((socket, peer)) => admit(&shared, socket, peer),
            Err(e) if is_benign_disconnect(&e) => {
                debug!(error = %e, "accept failed");
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("accept loop stopped");
}

/// Applies the connection ceiling, then hands the socket to its own task.
fn admit(shared: &Arc<Shared>, socket: TcpStream, peer: SocketAddr) {
    let max = shared.max_connections.load(Ordering::Relaxed);
    let live = shared.registry.len();
    if max != 0 && live >= max {
        trace!(%peer, live, max, "connection rejected at capacity");
        return;
    }

    if let Err(e) = socket.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let info = ConnectionInfo {
        id,
        peer_addr: Some(peer),
        local_addr: socket.local_addr().ok(),
    };

    let key = shared.registry.insert(id);
    let registry = shared.registry.clone();
    let conn = Connection::new(
        socket,
        info,
        shared.app.clone(),
        shared.pool.clone(),
        shared.limits.clone(),
    )
    .with_shutdown(shared.shutdown.subscribe())
    .on_close(move || {
        registry.remove(key, id);
    });

    debug!(conn = id, %peer, "accepted connection");

    let task = tokio::spawn(async move {
        match conn.run().await {
            Ok(()) => {}
            Err(e) if is_benign_disconnect(&e) => {
                debug!(conn = id, %peer, error = %e, "connection dropped by peer");
            }
            Err(e) => {
                error!(conn = id, %peer, error = %e, "connection error");
            }
        }
    });
    shared.registry.attach(key, id, task.abort_handle());

    if shared.hint.should_fire(live + 1) {
        let trimmed = shared.pool.trim();
        debug!(live = live + 1, trimmed, "memory hint fired, trimmed idle pool objects");
    }
}
