//! Object recycling for the hot per-request allocations.
//!
//! Every exchange needs a parser (one per connection), an
//! [`IncomingMessage`] and a [`ServerResponse`]. Rather than allocating
//! them fresh each time, the server keeps three bounded free-lists and hands
//! out reset instances. Ownership does the bookkeeping: `release` takes the
//! object by value, so it cannot be released twice or stay reachable from an
//! exchange after it was returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tracing::trace;

use crate::http::parser::{Http1Parser, MessageParser};
use crate::http::request::IncomingMessage;
use crate::http::response::ServerResponse;

/// Objects that can be put back into their initial state.
pub trait Recycle {
    /// Resets every field and drops outside references.
    ///
    /// Returns `false` when the object cannot be reused and must be dropped.
    fn recycle(&mut self) -> bool;
}

impl Recycle for IncomingMessage {
    fn recycle(&mut self) -> bool {
        self.reset();
        true
    }
}

impl Recycle for ServerResponse {
    fn recycle(&mut self) -> bool {
        self.reset();
        true
    }
}

impl Recycle for Box<dyn MessageParser> {
    fn recycle(&mut self) -> bool {
        self.reset().is_ok()
    }
}

/// A bounded LIFO stack of idle objects.
pub struct FreeList<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Recycle> FreeList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            capacity,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops an idle object, or builds one with `make` when none is left.
    pub fn acquire_with(&self, make: impl FnOnce() -> T) -> T {
        let recycled = self.lock().pop();
        match recycled {
            Some(item) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                make()
            }
        }
    }

    /// Recycles `item` and keeps it if there is room.
    ///
    /// Returns `false` when the object was dropped instead, either because it
    /// failed to reset or because the list is at its ceiling.
    pub fn release(&self, mut item: T) -> bool {
        if !item.recycle() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut items = self.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push(item);
        true
    }

    /// Drops idle objects down to `keep`, returning how many were dropped.
    pub fn trim(&self, keep: usize) -> usize {
        let mut items = self.lock();
        let excess = items.len().saturating_sub(keep);
        items.truncate(keep);
        items.shrink_to_fit();
        excess
    }

    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FreeListStats {
        FreeListStats {
            idle: self.idle(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeListStats {
    /// Objects currently waiting for reuse.
    pub idle: usize,
    /// Objects built because the list was empty.
    pub created: u64,
    /// Objects handed out from the list.
    pub reused: u64,
    /// Released objects dropped (failed reset or list full).
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub parsers: FreeListStats,
    pub messages: FreeListStats,
    pub responses: FreeListStats,
}

/// Capacity ceilings for the three free-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    pub parsers: usize,
    pub messages: usize,
    pub responses: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            parsers: 256,
            messages: 256,
            responses: 256,
        }
    }
}

/// Builds a parser when the free-list is empty.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn MessageParser> + Send + Sync>;

/// The server's three free-lists: parsers, inbound messages, responses.
pub struct ResourcePool {
    parsers: FreeList<Box<dyn MessageParser>>,
    messages: FreeList<IncomingMessage>,
    responses: FreeList<ServerResponse>,
    new_parser: ParserFactory,
}

impl ResourcePool {
    /// Creates a pool producing [`Http1Parser`]s.
    pub fn new(limits: PoolLimits) -> Self {
        Self::with_parser_factory(limits, Arc::new(|| Box::new(Http1Parser::new()) as Box<dyn MessageParser>))
    }

    pub fn with_parser_factory(limits: PoolLimits, new_parser: ParserFactory) -> Self {
        Self {
            parsers: FreeList::new(limits.parsers),
            messages: FreeList::new(limits.messages),
            responses: FreeList::new(limits.responses),
            new_parser,
        }
    }

    pub fn acquire_parser(&self) -> Box<dyn MessageParser> {
        self.parsers.acquire_with(|| (self.new_parser)())
    }

    /// Returns a parser; one that fails to reset is dropped.
    pub fn release_parser(&self, parser: Box<dyn MessageParser>) {
        if !self.parsers.release(parser) {
            trace!("parser dropped instead of pooled");
        }
    }

    pub fn acquire_message(&self) -> IncomingMessage {
        self.messages.acquire_with(IncomingMessage::new)
    }

    pub fn release_message(&self, message: IncomingMessage) {
        self.messages.release(message);
    }

    pub fn acquire_response(&self) -> ServerResponse {
        self.responses.acquire_with(ServerResponse::new)
    }

    pub fn release_response(&self, response: ServerResponse) {
        self.responses.release(response);
    }

    /// Drops idle objects down to half of each ceiling.
    pub fn trim(&self) -> usize {
        self.parsers.trim(self.parsers.capacity() / 2)
            + self.messages.trim(self.messages.capacity() / 2)
            + self.responses.trim(self.responses.capacity() / 2)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            parsers: self.parsers.stats(),
            messages: self.messages.stats(),
            responses: self.responses.stats(),
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        value: u32,
        reusable: bool,
    }

    impl Recycle for Counter {
        fn recycle(&mut self) -> bool {
            self.value = 0;
            self.reusable
        }
    }

    #[test]
    fn release_respects_ceiling() {
        let list = FreeList::new(1);

        assert!(list.release(Counter { value: 1, reusable: true }));
        assert!(!list.release(Counter { value: 2, reusable: true }));

        let stats = list.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn acquire_hands_out_reset_objects() {
        let list = FreeList::new(4);
        list.release(Counter { value: 7, reusable: true });

        let item = list.acquire_with(Counter::default);

        assert_eq!(item.value, 0);
        assert_eq!(list.stats().reused, 1);
    }

    #[test]
    fn release_drops_connection_back_reference() {
        use crate::http::parser::ParsedRequest;
        use crate::http::request::{ConnectionInfo, Version};

        let pool = ResourcePool::default();
        let info = Arc::new(ConnectionInfo {
            id: 7,
            peer_addr: None,
            local_addr: None,
        });

        let mut message = pool.acquire_message();
        message.fill(
            ParsedRequest {
                method: "GET".into(),
                target: "/".into(),
                version: Version::HTTP_11,
                headers: Vec::new(),
                body: Default::default(),
            },
            Some(info.clone()),
        );
        let mut response = pool.acquire_response();
        response.bind(Some(info.clone()), true);
        assert_eq!(Arc::strong_count(&info), 3);

        pool.release_message(message);
        pool.release_response(response);

        assert_eq!(Arc::strong_count(&info), 1);
        assert!(pool.acquire_message().connection().is_none());
        assert!(pool.acquire_response().connection().is_none());
    }

    #[test]
    fn unrecyclable_objects_are_dropped() {
        let list = FreeList::new(4);
        assert!(!list.release(Counter { value: 1, reusable: false }));
        assert_eq!(list.idle(), 0);
    }
}
