use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ferry::http::dispatcher::{App, BatchDispatcher, Exchange, Flush, Handler};
use ferry::http::parser::ParsedRequest;
use ferry::http::request::{IncomingMessage, Version};
use ferry::http::response::{ResponseState, ServerResponse};
use ferry::pool::ResourcePool;

fn exchange(target: &str) -> Exchange {
    Exchange {
        request: IncomingMessage::from_parsed(ParsedRequest {
            method: "GET".to_string(),
            target: target.to_string(),
            version: Version::HTTP_11,
            headers: Vec::new(),
            body: Bytes::new(),
        }),
        response: ServerResponse::new(),
    }
}

fn app<H: Handler>(handler: H) -> App {
    App::new(Arc::new(handler))
}

fn body(res: &ServerResponse) -> String {
    let wire = String::from_utf8(res.serialized().unwrap().to_vec()).unwrap();
    wire.split_once("\r\n\r\n").unwrap().1.to_string()
}

fn echo(req: &IncomingMessage, res: &mut ServerResponse) -> anyhow::Result<()> {
    res.end_with(req.target().to_string());
    Ok(())
}

#[test]
fn test_batch_fills_then_flushes_now() {
    let mut batch = BatchDispatcher::new(3);

    assert_eq!(batch.push(exchange("/1")), Flush::Deferred);
    assert_eq!(batch.push(exchange("/2")), Flush::Deferred);
    assert_eq!(batch.push(exchange("/3")), Flush::Now);
    assert_eq!(batch.len(), 3);
}

#[test]
fn test_batch_of_one_flushes_every_exchange() {
    let mut batch = BatchDispatcher::new(1);

    assert_eq!(batch.push(exchange("/one")), Flush::Now);
}

#[test]
fn test_flush_preserves_order_and_empties_queue() {
    let pool = ResourcePool::default();
    let app = app(echo);
    let mut batch = BatchDispatcher::new(8);
    for target in ["/a", "/b", "/c"] {
        batch.push(exchange(target));
    }

    let done = batch.flush(&app, &pool);

    let bodies: Vec<String> = done.iter().map(body).collect();
    assert_eq!(bodies, ["/a", "/b", "/c"]);
    assert!(batch.is_empty());
    assert_eq!(pool.stats().messages.idle, 3);
}

#[test]
fn test_handler_error_yields_500() {
    let pool = ResourcePool::default();
    let app = app(|_: &IncomingMessage, _: &mut ServerResponse| -> anyhow::Result<()> {
        anyhow::bail!("database exploded")
    });
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));

    let done = batch.flush(&app, &pool);

    assert_eq!(done[0].status_code(), 500);
    assert!(done[0].finished());
    assert_eq!(body(&done[0]), "Internal Server Error");
}

#[test]
fn test_handler_panic_is_contained() {
    let pool = ResourcePool::default();
    let app = app(|req: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        if req.target() == "/boom" {
            panic!("handler bug");
        }
        res.end_with("fine");
        Ok(())
    });
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/boom"));
    batch.push(exchange("/ok"));

    let done = batch.flush(&app, &pool);

    assert_eq!(done[0].status_code(), 500);
    assert_eq!(done[1].status_code(), 200);
    assert_eq!(body(&done[1]), "fine");
}

#[test]
fn test_failure_after_end_keeps_response() {
    let pool = ResourcePool::default();
    let app = app(|_: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        res.end_with("sent");
        anyhow::bail!("late failure")
    });
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));

    let done = batch.flush(&app, &pool);

    assert_eq!(done[0].status_code(), 200);
    assert_eq!(body(&done[0]), "sent");
}

#[test]
fn test_failure_after_write_head_closes_connection() {
    let pool = ResourcePool::default();
    let app = app(|_: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        res.write_head(200, None)?;
        res.write("partial")?;
        anyhow::bail!("stream broke")
    });
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));

    let done = batch.flush(&app, &pool);

    assert_eq!(done[0].state(), ResponseState::Finished);
    assert!(!done[0].keep_alive());
    assert_eq!(body(&done[0]), "partial");
}

#[test]
fn test_observers_run_before_handler() {
    let pool = ResourcePool::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    let handler_log = log.clone();
    let app = app(move |req: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        handler_log.lock().unwrap().push(format!("handler {}", req.target()));
        res.end();
        Ok(())
    });
    let observer_log = log.clone();
    app.observe(Arc::new(move |req: &IncomingMessage, _: &mut ServerResponse| -> anyhow::Result<()> {
        observer_log.lock().unwrap().push(format!("observer {}", req.target()));
        Ok(())
    }));

    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/x"));
    batch.flush(&app, &pool);

    assert_eq!(*log.lock().unwrap(), ["observer /x", "handler /x"]);
}

#[test]
fn test_failing_observer_does_not_skip_handler() {
    let pool = ResourcePool::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let app = app(move |_: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        res.end_with("handled");
        Ok(())
    });
    app.observe(Arc::new(|_: &IncomingMessage, _: &mut ServerResponse| -> anyhow::Result<()> {
        anyhow::bail!("observer failed")
    }));

    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));
    let done = batch.flush(&app, &pool);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(body(&done[0]), "handled");
}

#[test]
fn test_unfinished_response_is_left_open() {
    let pool = ResourcePool::default();
    let app = app(|_: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        res.write("no end")?;
        Ok(())
    });
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));

    let done = batch.flush(&app, &pool);

    assert!(!done[0].finished());
}

#[test]
fn test_write_callbacks_run_after_handler_returns() {
    let pool = ResourcePool::default();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handler_order = order.clone();
    let app = app(move |_: &IncomingMessage, res: &mut ServerResponse| -> anyhow::Result<()> {
        let cb_order = handler_order.clone();
        res.write_with("a", move || cb_order.lock().unwrap().push("write callback"))?;
        let cb_order = handler_order.clone();
        res.end_with_callback(move || cb_order.lock().unwrap().push("end callback"));
        handler_order.lock().unwrap().push("handler returned");
        Ok(())
    });

    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/"));
    batch.flush(&app, &pool);

    assert_eq!(
        *order.lock().unwrap(),
        ["handler returned", "write callback", "end callback"]
    );
}

#[test]
fn test_discard_releases_queued_exchanges() {
    let pool = ResourcePool::default();
    let mut batch = BatchDispatcher::new(4);
    batch.push(exchange("/a"));
    batch.push(exchange("/b"));

    batch.discard(&pool);

    assert!(batch.is_empty());
    assert_eq!(pool.stats().messages.idle, 2);
    assert_eq!(pool.stats().responses.idle, 2);
}
