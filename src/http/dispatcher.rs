use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::http::request::IncomingMessage;
use crate::http::response::ServerResponse;
use crate::pool::ResourcePool;

/// Application code invoked once per exchange.
///
/// The handler is expected to finish the response (`end`, `end_with`)
/// before returning. An `Err` or a panic is contained to this exchange.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &IncomingMessage, res: &mut ServerResponse) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&IncomingMessage, &mut ServerResponse) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, req: &IncomingMessage, res: &mut ServerResponse) -> anyhow::Result<()> {
        self(req, res)
    }
}

/// The request handler plus any observers registered on the server.
pub struct App {
    handler: Arc<dyn Handler>,
    observers: RwLock<Vec<Arc<dyn Handler>>>,
}

impl App {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers an observer; observers run before the handler.
    pub fn observe(&self, observer: Arc<dyn Handler>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn Handler>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One request paired with its response.
#[derive(Debug)]
pub struct Exchange {
    pub request: IncomingMessage,
    pub response: ServerResponse,
}

/// When the queued exchanges should be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Flush before reading further (batch full or connection closing).
    Now,
    /// Flush after one scheduler tick.
    Deferred,
}

/// Queues ready exchanges and runs the application over them in order.
pub struct BatchDispatcher {
    queue: VecDeque<Exchange>,
    batch_size: usize,
}

impl BatchDispatcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            queue: VecDeque::with_capacity(batch_size),
            batch_size,
        }
    }

    pub fn push(&mut self, exchange: Exchange) -> Flush {
        let closing = !exchange.response.keep_alive();
        self.queue.push_back(exchange);
        if closing || self.queue.len() >= self.batch_size {
            Flush::Now
        } else {
            Flush::Deferred
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Invokes the application for every queued exchange.
    ///
    /// Requests go back to the pool; responses are returned in queue order.
    pub fn flush(&mut self, app: &App, pool: &ResourcePool) -> Vec<ServerResponse> {
        let observers = app.observers();
        let mut done = Vec::with_capacity(self.queue.len());

        while let Some(Exchange {
            request,
            mut response,
        }) = self.queue.pop_front()
        {
            let mut failed = false;
            for observer in &observers {
                failed |= !invoke(observer.as_ref(), &request, &mut response);
            }
            failed |= !invoke(app.handler.as_ref(), &request, &mut response);

            if failed && !response.finished() {
                response.fail_internal();
            }

            for callback in response.take_deferred() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    warn!(panic = panic_message(&*payload), "write callback panicked");
                }
            }

            pool.release_message(request);
            done.push(response);
        }

        done
    }

    /// Drops queued exchanges without running them.
    pub fn discard(&mut self, pool: &ResourcePool) {
        for Exchange { request, response } in self.queue.drain(..) {
            pool.release_message(request);
            pool.release_response(response);
        }
    }
}

/// Runs one handler inside its own failure boundary.
fn invoke(handler: &dyn Handler, req: &IncomingMessage, res: &mut ServerResponse) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req, res))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(
                method = %req.method(),
                path = req.target(),
                error = %e,
                "request handler failed"
            );
            false
        }
        Err(payload) => {
            error!(
                method = %req.method(),
                path = req.target(),
                panic = panic_message(&*payload),
                "request handler panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
