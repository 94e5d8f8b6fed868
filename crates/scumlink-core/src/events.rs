//! Listener registration for component events
//!
//! Each emitting component owns an [`EventHub`]. Subscribers are called
//! synchronously, in subscription order, on the thread that raised the
//! event. The subscriber list is snapshotted before delivery so a
//! subscriber may unsubscribe itself (or others) from inside its callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`EventHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of event subscribers
pub struct EventHub<E> {
    listeners: Mutex<Vec<(SubscriptionId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    /// Create a hub with no subscribers
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener<E>)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Deliver an event to every current subscriber
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nobody is listening
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}
