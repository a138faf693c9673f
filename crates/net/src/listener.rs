//! Event observers and their registries
//!
//! Dispatch is synchronous: the task that produced an event (a connection's
//! read loop, or the caller of `kick`/`close`) waits until every registered
//! listener has returned. Listeners that need to do I/O should hand the work
//! to a spawned task instead of blocking.

use std::sync::{Arc, RwLock};

use crate::connection::Connection;

/// Server-wide observer of client lifecycle and messages
pub trait ClientListener: Send + Sync {
    /// A client was accepted; fired before its read loop starts
    fn on_connect(&self, _client: &Arc<Connection>) {}

    /// A client went away, for whatever reason; fired exactly once
    fn on_disconnect(&self, _client: &Arc<Connection>) {}

    /// A payload frame arrived from a client
    fn on_message(&self, _client: &Arc<Connection>, _message: &str) {}
}

/// Observer of the clients inside one room
pub trait RoomListener: Send + Sync {
    /// A member of the room went away; fired exactly once
    fn on_client_disconnect(&self, _client: &Arc<Connection>) {}

    /// A payload frame arrived from a member of the room
    fn on_client_message(&self, _client: &Arc<Connection>, _message: &str) {}
}

/// Client-side observer of the server connection
pub trait ServerListener: Send + Sync {
    /// The connection to the server ended; fired exactly once
    fn on_disconnect(&self) {}

    /// A payload frame arrived from the server
    fn on_message(&self, _message: &str) {}
}

/// Insertion-ordered set of listeners compared by identity
///
/// Dispatch iterates over a snapshot, so listeners may be added or removed
/// from inside a callback.
pub(crate) struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    /// Returns false if this exact listener is already registered
    pub(crate) fn add(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if listeners.iter().any(|l| same(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        listeners.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub(crate) fn dispatch(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&*listener);
        }
    }
}

// Compare data pointers only; vtable pointers of the same object may differ.
fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    trait Probe: Send + Sync {
        fn hit(&self, log: &Mutex<Vec<&'static str>>);
    }

    struct Named(&'static str);

    impl Probe for Named {
        fn hit(&self, log: &Mutex<Vec<&'static str>>) {
            log.lock().unwrap().push(self.0);
        }
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let set: ListenerSet<dyn Probe> = ListenerSet::default();
        let a: Arc<dyn Probe> = Arc::new(Named("a"));

        assert!(set.add(a.clone()));
        assert!(!set.add(a.clone()));
        assert_eq!(set.len(), 1);

        // Same type, different object
        assert!(set.add(Arc::new(Named("a"))));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_by_identity() {
        let set: ListenerSet<dyn Probe> = ListenerSet::default();
        let a: Arc<dyn Probe> = Arc::new(Named("a"));
        let b: Arc<dyn Probe> = Arc::new(Named("b"));
        set.add(a.clone());
        set.add(b.clone());

        assert!(set.remove(&a));
        assert!(!set.remove(&a));

        let log = Mutex::new(Vec::new());
        set.dispatch(|l| l.hit(&log));
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_dispatch_in_insertion_order() {
        let set: ListenerSet<dyn Probe> = ListenerSet::default();
        for name in ["first", "second", "third"] {
            set.add(Arc::new(Named(name)));
        }

        let log = Mutex::new(Vec::new());
        set.dispatch(|l| l.hit(&log));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_mutation_during_dispatch() {
        let set: Arc<ListenerSet<dyn Probe>> = Arc::new(ListenerSet::default());
        let a: Arc<dyn Probe> = Arc::new(Named("a"));
        set.add(a.clone());
        set.add(Arc::new(Named("b")));

        let log = Mutex::new(Vec::new());
        set.dispatch(|l| {
            l.hit(&log);
            set.remove(&a);
            set.add(Arc::new(Named("late")));
        });

        // The snapshot taken at dispatch start is delivered exactly once
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(set.len(), 3);
    }
}
