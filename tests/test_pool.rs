use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use ferry::Server;
use ferry::http::parser::{Http1Parser, MessageParser, ParseError, ParsedRequest};
use ferry::http::request::{IncomingMessage, Version};
use ferry::http::response::ServerResponse;
use ferry::pool::{PoolLimits, ResourcePool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn parsed(target: &str) -> ParsedRequest {
    ParsedRequest {
        method: "POST".to_string(),
        target: target.to_string(),
        version: Version::HTTP_10,
        headers: vec![("Host".to_string(), "a".to_string())],
        body: Bytes::from_static(b"payload"),
    }
}

fn limits(n: usize) -> PoolLimits {
    PoolLimits {
        parsers: n,
        messages: n,
        responses: n,
    }
}

#[test]
fn test_acquire_builds_fresh_objects_when_empty() {
    let pool = ResourcePool::default();

    let msg = pool.acquire_message();
    let res = pool.acquire_response();

    assert_eq!(msg.target(), "");
    assert!(!res.finished());
    let stats = pool.stats();
    assert_eq!(stats.messages.created, 1);
    assert_eq!(stats.responses.created, 1);
}

#[test]
fn test_released_message_is_reset_and_detached() {
    let pool = ResourcePool::default();
    let mut msg = IncomingMessage::from_parsed(parsed("/first"));
    assert_eq!(msg.target(), "/first");
    assert!(msg.connection().is_none());

    pool.release_message(msg);
    msg = pool.acquire_message();

    assert_eq!(pool.stats().messages.reused, 1);
    assert_eq!(msg.target(), "");
    assert!(msg.headers().is_empty());
    assert!(msg.body().is_empty());
    assert_eq!(msg.version(), Version::HTTP_11);
    assert!(msg.connection().is_none());
}

#[test]
fn test_released_response_is_reset() {
    let pool = ResourcePool::default();
    let mut res = pool.acquire_response();
    res.set_status(404u16).unwrap();
    res.set_header("X-Old", "1").unwrap();
    res.end_with("gone");

    pool.release_response(res);
    let res = pool.acquire_response();

    assert_eq!(res.status_code(), 200);
    assert!(!res.headers_sent());
    assert_eq!(res.body_len(), 0);
    assert_eq!(res.get_header("X-Old").unwrap(), None);
    assert!(res.serialized().is_none());
    assert!(res.connection().is_none());
}

#[test]
fn test_ceiling_bounds_idle_objects() {
    let pool = ResourcePool::new(limits(2));

    for _ in 0..5 {
        pool.release_response(ServerResponse::new());
    }

    let stats = pool.stats().responses;
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.discarded, 3);
}

#[test]
fn test_zero_ceiling_disables_pooling() {
    let pool = ResourcePool::new(limits(0));
    pool.release_message(IncomingMessage::new());

    assert_eq!(pool.stats().messages.idle, 0);
}

#[test]
fn test_failed_parser_is_not_pooled() {
    let pool = ResourcePool::default();

    let mut parser = pool.acquire_parser();
    assert!(parser.execute(b"NOT A REQUEST").is_err());
    pool.release_parser(parser);

    let stats = pool.stats().parsers;
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.discarded, 1);
}

#[test]
fn test_parser_is_reset_on_release() {
    let pool = ResourcePool::default();

    let mut parser = pool.acquire_parser();
    parser.execute(b"GET /half HTTP/1.1\r\nContent-Length: 4\r\n\r\nab").unwrap();
    pool.release_parser(parser);

    let mut parser = pool.acquire_parser();
    parser.execute(b"GET /next HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(parser.take_result().unwrap().target, "/next");
    assert_eq!(pool.stats().parsers.reused, 1);
}

#[test]
fn test_custom_parser_factory() {
    struct Counting(Http1Parser);

    impl MessageParser for Counting {
        fn execute(&mut self, input: &[u8]) -> Result<usize, ParseError> {
            self.0.execute(input)
        }
        fn is_complete(&self) -> bool {
            self.0.is_complete()
        }
        fn take_result(&mut self) -> Option<ParsedRequest> {
            self.0.take_result()
        }
        fn reset(&mut self) -> Result<(), ParseError> {
            self.0.reset()
        }
    }

    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let pool = ResourcePool::with_parser_factory(
        PoolLimits::default(),
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Counting(Http1Parser::new())) as Box<dyn MessageParser>
        }),
    );

    let parser = pool.acquire_parser();
    pool.release_parser(parser);
    let _parser = pool.acquire_parser();

    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[test]
fn test_trim_keeps_half_of_each_ceiling() {
    let pool = ResourcePool::new(limits(8));
    for _ in 0..8 {
        pool.release_message(IncomingMessage::new());
        pool.release_response(ServerResponse::new());
    }

    let dropped = pool.trim();

    assert_eq!(dropped, 8);
    assert_eq!(pool.stats().messages.idle, 4);
    assert_eq!(pool.stats().responses.idle, 4);
}

#[tokio::test]
async fn test_exchange_objects_return_to_the_server_pool() {
    let server = Server::new(|req: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        let peer: Option<SocketAddr> = req.connection().and_then(|c| c.peer_addr);
        assert!(peer.is_some());
        assert!(res.connection().is_some());
        res.end();
        Ok(())
    });
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));

    let stats = server.pool_stats();
    assert_eq!(stats.messages.idle, 1);
    assert_eq!(stats.responses.idle, 1);
    server.close().await;
}
