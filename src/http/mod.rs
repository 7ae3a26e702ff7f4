//! HTTP/1.x protocol engine.
//!
//! This module turns raw transport bytes into request/response exchanges and
//! writes the answers back, with keep-alive and pipelining support.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`parser`**: Incremental request parser behind the `MessageParser` trait
//! - **`assembler`**: Buffers partial reads and yields complete requests
//! - **`headers`**: Ordered, case-insensitive header container
//! - **`request`**: `IncomingMessage`, the request handed to handlers
//! - **`response`**: `ServerResponse`, the response a handler builds
//! - **`writer`**: Serializes responses and writes them to the transport
//! - **`dispatcher`**: Batches exchanges and runs the handler over them
//! - **`connection`**: The per-connection state machine tying it together
//!
//! # Request Flow
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for bytes, feed the assembler
//!        └──────┬──────┘
//!               │ Request complete
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← Queue the exchange, run the handler per batch
//!        └──────┬───────────┘
//!               │ Response finished
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← One contiguous write per response, in order
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferry::http::connection::{Connection, ConnectionLimits};
//! use ferry::http::dispatcher::App;
//! use ferry::http::request::{ConnectionInfo, IncomingMessage};
//! use ferry::http::response::ServerResponse;
//! use ferry::pool::ResourcePool;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let app = Arc::new(App::new(Arc::new(
//!         |_req: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
//!             res.end_with("hello");
//!             Ok(())
//!         },
//!     )));
//!     let pool = Arc::new(ResourcePool::default());
//!     let limits = Arc::new(ConnectionLimits::default());
//!
//!     for id in 0.. {
//!         let (socket, peer) = listener.accept().await?;
//!         let info = ConnectionInfo { id, peer_addr: Some(peer), local_addr: None };
//!         let conn = Connection::new(socket, info, app.clone(), pool.clone(), limits.clone());
//!         tokio::spawn(async move {
//!             if let Err(e) = conn.run().await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod connection;
pub mod dispatcher;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
