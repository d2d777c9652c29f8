//! Listener registration shared by every event source.
//!
//! An event source owns a [`Listeners`] per event type. Subscribing returns a
//! [`Subscription`], the only capability able to remove that listener again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Handle to one registered listener.
///
/// Unsubscribing is idempotent and also happens on drop.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Ordered set of listeners of one handler type `F` (usually a `dyn Fn`).
pub struct Listeners<F: ?Sized> {
    entries: Mutex<Vec<(u64, Arc<F>)>>,
    next_id: AtomicU64,
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Register `handler`. The returned subscription holds only a weak
    /// reference, so it never keeps the event source alive.
    pub fn subscribe(self: &Arc<Self>, handler: Arc<F>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, handler));

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.remove(id);
            }
        })
    }

    /// Current handlers, cloned out so callers invoke them without holding
    /// the lock. A handler may unsubscribe itself (or others) while running.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }
}
