use std::sync::{Mutex, MutexGuard, PoisonError};

use slab::Slab;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

struct Entry {
    id: u64,
    task: Option<AbortHandle>,
}

/// Live connections of one server, keyed by slab slot.
///
/// Slots are reused, so every operation also checks the connection id the
/// slot was handed out for.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Entry>>,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Slab::new()),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Entry>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers connection `id` and returns its slot.
    pub fn insert(&self, id: u64) -> usize {
        self.lock().insert(Entry { id, task: None })
    }

    /// Remembers the task driving the connection so it can be aborted.
    ///
    /// No-op if the connection already deregistered.
    pub fn attach(&self, key: usize, id: u64, task: AbortHandle) {
        let mut connections = self.lock();
        match connections.get_mut(key) {
            Some(entry) if entry.id == id => entry.task = Some(task),
            _ => {}
        }
    }

    /// Deregisters a connection. Returns `false` if it was already gone.
    pub fn remove(&self, key: usize, id: u64) -> bool {
        let mut connections = self.lock();
        let registered = connections.get(key).is_some_and(|entry| entry.id == id);
        if registered {
            connections.remove(key);
        }
        let empty = connections.is_empty();
        drop(connections);

        if empty {
            self.drained.notify_waiters();
        }
        registered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Aborts every connection task still registered, returning how many.
    pub fn abort_all(&self) -> usize {
        let connections = self.lock();
        let mut aborted = 0;
        for (_, entry) in connections.iter() {
            if let Some(task) = &entry.task {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Waits until no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
