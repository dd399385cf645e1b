//! Minimal synchronous pub/sub used by download engines and their consumers.
//!
//! Listeners are plain closures. They run in the emitter's task, in the order
//! they were registered, and may unsubscribe themselves (or anything else)
//! while an emission is in progress.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Listener<E> {
    id: SubscriptionId,
    namespace: Option<String>,
    handler: Handler<E>,
}

struct Listeners<E> {
    next_id: u64,
    entries: Vec<Listener<E>>,
}

pub struct EventBus<E> {
    inner: Arc<Mutex<Listeners<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

fn lock<E>(inner: &Mutex<Listeners<E>>) -> MutexGuard<'_, Listeners<E>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers `handler`. The listener lives until the returned guard is
    /// dropped, unless the guard is detached.
    pub fn subscribe<F>(&self, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Like [`subscribe`](Self::subscribe) but tags the listener so a whole
    /// group can be dropped with [`remove_namespace`](Self::remove_namespace).
    pub fn subscribe_in<F>(&self, namespace: &str, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(namespace.to_string()), Arc::new(handler))
    }

    fn insert(&self, namespace: Option<String>, handler: Handler<E>) -> Subscription<E> {
        let mut listeners = lock(&self.inner);
        let id = SubscriptionId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push(Listener {
            id,
            namespace,
            handler,
        });

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            armed: true,
        }
    }

    /// Returns whether a listener was actually removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|l| l.id != id);
        listeners.entries.len() != before
    }

    pub fn remove_namespace(&self, namespace: &str) -> usize {
        let mut listeners = lock(&self.inner);
        let before = listeners.entries.len();
        listeners
            .entries
            .retain(|l| l.namespace.as_deref() != Some(namespace));
        before - listeners.entries.len()
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener registered at the time of the call.
    /// A listener removed mid-emission is skipped if it has not run yet.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = lock(&self.inner)
            .entries
            .iter()
            .map(|l| (l.id, l.handler.clone()))
            .collect();

        for (id, handler) in snapshot {
            let live = lock(&self.inner).entries.iter().any(|l| l.id == id);
            if live {
                handler(event);
            }
        }
    }
}

/// Scoped listener handle. Dropping it deregisters the listener.
#[must_use = "dropping a Subscription immediately unsubscribes it"]
pub struct Subscription<E> {
    id: SubscriptionId,
    bus: Weak<Mutex<Listeners<E>>>,
    armed: bool,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Keeps the listener registered for the lifetime of the bus.
    pub fn detach(mut self) -> SubscriptionId {
        self.armed = false;
        self.id
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner).entries.retain(|l| l.id != self.id);
        }
    }
}
