//! Connection lifecycle observation.
//!
//! Lifecycle events propagate from the broker client to caches, message
//! handlers and their observers. Each connection carries an opaque
//! identifier; observers watching several connections filter on it to avoid
//! cross-talk.

use std::sync::Arc;

use parking_lot::RwLock;

/// Capability of reacting to broker connection lifecycle events.
pub trait ConnectionObserver: Send + Sync {
    /// The connection identified by `identifier` became usable.
    fn on_connection_recovered(&self, identifier: &str);

    /// The connection identified by `identifier` stopped being usable.
    fn on_connection_disrupted(&self, identifier: &str);

    /// The connection identified by `identifier` is gone for good; the
    /// reconnect policy gave up on it.
    fn on_connection_lost(&self, _identifier: &str) {}
}

/// A copy-on-write set of observers.
///
/// Notification paths take a snapshot and iterate it without holding any
/// lock; the lock is only taken while adding.
pub struct ObserverSet<T: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ObserverSet<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register an observer.
    pub fn add(&self, observer: Arc<T>) {
        let mut guard = self.inner.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(observer);
        *guard = Arc::new(next);
    }

    /// The current observers, detached from future mutations.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner.read().clone()
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter {
        recovered: AtomicUsize,
        disrupted: AtomicUsize,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                recovered: AtomicUsize::new(0),
                disrupted: AtomicUsize::new(0),
            }
        }
    }

    impl ConnectionObserver for Counter {
        fn on_connection_recovered(&self, _identifier: &str) {
            self.recovered.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connection_disrupted(&self, _identifier: &str) {
            self.disrupted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_snapshot_is_detached_from_later_adds() {
        let set: ObserverSet<dyn ConnectionObserver> = ObserverSet::new();
        set.add(Arc::new(Counter::new()));
        let snapshot = set.snapshot();
        set.add(Arc::new(Counter::new()));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_each_observer_notified_once() {
        let set: ObserverSet<dyn ConnectionObserver> = ObserverSet::new();
        let a = Arc::new(Counter::new());
        let b = Arc::new(Counter::new());
        set.add(a.clone());
        set.add(b.clone());

        for observer in set.snapshot().iter() {
            observer.on_connection_recovered("conn-1");
        }

        assert_eq!(a.recovered.load(Ordering::SeqCst), 1);
        assert_eq!(b.recovered.load(Ordering::SeqCst), 1);
        assert_eq!(a.disrupted.load(Ordering::SeqCst), 0);
    }
}
