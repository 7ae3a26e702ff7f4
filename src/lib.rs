//! Ferry - HTTP/1.x connection engine
//!
//! Core library: incremental request assembly, pooled request/response
//! objects, batched dispatch and the connection lifecycle.

pub mod config;
pub mod http;
pub mod pool;
pub mod server;

pub use server::{Server, ServerError, ServerOptions, create_server};
