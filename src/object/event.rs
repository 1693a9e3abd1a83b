//! Synchronous multicast events.
//!
//! Handlers run on the emitting thread, before `emit` returns. The binding's
//! reentrancy guard depends on this: a property set while applying a remote
//! change must be observed by the local handler while the guard is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Handlers<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Handler<T>)>>,
}

pub struct EventSource<T> {
    handlers: Arc<Handlers<T>>,
}

impl<T: 'static> EventSource<T> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Handlers {
                next_id: AtomicU64::new(1),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a handler; it stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.entries.write().push((id, Arc::new(handler)));

        let weak: Weak<Handlers<T>> = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = weak.upgrade() {
                handlers.entries.write().retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn emit(&self, event: &T) {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let handlers: Vec<Handler<T>> = self
            .handlers
            .entries
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.entries.read().len()
    }
}

impl<T: 'static> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle; unsubscribes on drop
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
