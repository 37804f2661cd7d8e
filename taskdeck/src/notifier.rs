//! Session-scoped publish/subscribe channel for task-collection changes.
//!
//! Observers register a zero-argument callback and get an [`ObserverHandle`] back;
//! dropping the handle unregisters the callback. Async consumers can instead take
//! a broadcast receiver via [`ChangeNotifier::change_rx()`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::broadcast;

use crate::messages::ChangeNotification;

/// Capacity of the broadcast channel backing [`ChangeNotifier::change_rx()`].
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

type Observer = Arc<dyn Fn() + Send + Sync>;

/// Cheap to clone; all clones share the same observers.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    observers: RwLock<HashMap<u64, Observer>>,
    next_observer: AtomicU64,
    sequence: AtomicU64,
    change_tx: broadcast::Sender<ChangeNotification>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (change_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(NotifierInner {
                observers: RwLock::new(HashMap::new()),
                next_observer: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                change_tx,
            }),
        }
    }

    /// Tell every observer the task collection changed.
    ///
    /// Callbacks run synchronously on the caller, after the registry lock is
    /// released, so an observer may unsubscribe (or subscribe) from inside its
    /// callback. Callers must publish only once their state change is visible.
    pub fn publish(&self) {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let observers: Vec<Observer> = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        log::debug!(
            "Publishing change #{sequence} to {} observer(s)",
            observers.len()
        );
        for observer in observers {
            observer();
        }
        let _ = self.inner.change_tx.send(ChangeNotification { sequence });
    }

    /// Register `observer`; it stays registered until the returned handle is dropped.
    pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(observer));
        ObserverHandle {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Get a handle to the change notification broadcast channel.
    pub fn change_rx(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.change_tx.subscribe()
    }

    /// Number of registered callback observers.
    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sequence number of the most recent notification (0 before the first).
    pub fn last_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("observers", &self.observer_count())
            .field("sequence", &self.last_sequence())
            .finish()
    }
}

/// Registration of one observer. Unregisters on drop.
#[must_use = "dropping the handle unsubscribes the observer immediately"]
pub struct ObserverHandle {
    id: u64,
    notifier: Weak<NotifierInner>,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner
                .observers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle").field("id", &self.id).finish()
    }
}
