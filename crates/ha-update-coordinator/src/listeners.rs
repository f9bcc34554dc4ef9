//! Listener registry
//!
//! Tracks the callbacks (usually entities) interested in a coordinator's
//! refreshes. Removal is idempotent, and notification isolates callbacks
//! from each other: a callback that panics is logged and the fan-out goes on.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use tracing::{error, trace};

use crate::lock::lock;

/// Callback invoked after every committed refresh
///
/// Callbacks receive no arguments; they read the coordinator they were
/// registered on.
pub type ListenerCallback = Arc<dyn Fn() + Send + Sync>;

/// A unique identifier for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener {
    callback: ListenerCallback,
    context: Option<String>,
}

/// Insertion-ordered set of listeners
pub struct ListenerRegistry {
    listeners: Mutex<IndexMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback
    ///
    /// Returns the new listener's id and whether it is the first listener,
    /// which is the coordinator's cue to start polling.
    pub fn add(&self, callback: ListenerCallback, context: Option<String>) -> (ListenerId, bool) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = lock(&self.listeners);
        let first = listeners.is_empty();
        listeners.insert(id, Listener { callback, context });
        trace!(?id, first, "Added listener");
        (id, first)
    }

    /// Remove a listener; unknown or already removed ids are ignored
    ///
    /// Returns true when this call removed the last listener, which is the
    /// coordinator's cue to stop polling.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let removed = listeners.shift_remove(&id).is_some();
        trace!(?id, removed, "Removed listener");
        removed && listeners.is_empty()
    }

    /// Invoke every registered callback
    ///
    /// Callbacks run outside the registry lock against a snapshot taken when
    /// the fan-out starts, so a callback may add or remove listeners. Returns
    /// the number of callbacks that completed without panicking.
    pub fn notify_all(&self, owner: &str) -> usize {
        let snapshot: Vec<(ListenerId, ListenerCallback)> = lock(&self.listeners)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(&listener.callback)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    error!(
                        coordinator = %owner,
                        listener = ?id,
                        "Error in listener callback: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        delivered
    }

    /// Distinct contexts registered by current listeners, in insertion order
    pub fn contexts(&self) -> Vec<String> {
        let listeners = lock(&self.listeners);
        let mut contexts: Vec<String> = Vec::new();
        for context in listeners.values().filter_map(|l| l.context.as_ref()) {
            if !contexts.contains(context) {
                contexts.push(context.clone());
            }
        }
        contexts
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        lock(&self.listeners).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }

    /// Drop every listener
    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owner of a registry that can drop a listener on a handle's behalf
pub(crate) trait ListenerHost: Send + Sync {
    fn remove_listener(&self, id: ListenerId);
}

/// Returned by `add_listener`; call [`ListenerHandle::remove`] to unsubscribe
///
/// The handle only holds a weak reference, so it never keeps a coordinator
/// alive. Removing twice, or after the coordinator is gone, does nothing.
pub struct ListenerHandle {
    id: ListenerId,
    host: Weak<dyn ListenerHost>,
}

impl ListenerHandle {
    pub(crate) fn new(id: ListenerId, host: Weak<dyn ListenerHost>) -> Self {
        Self { id, host }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unsubscribe
    pub fn remove(&self) {
        if let Some(host) = self.host.upgrade() {
            host.remove_listener(self.id);
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> ListenerCallback {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_first_and_last_listener_signals() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, first_a) = registry.add(counting(&calls), None);
        let (b, first_b) = registry.add(counting(&calls), None);
        assert!(first_a);
        assert!(!first_b);

        assert!(!registry.remove(a));
        assert!(registry.remove(b));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (id, _) = registry.add(counting(&calls), None);

        assert!(registry.remove(id));
        // Second removal neither fails nor reports "became empty" again
        assert!(!registry.remove(id));
        // Never-registered id
        assert!(!registry.remove(ListenerId(9999)));
    }

    #[test]
    fn test_notify_all_calls_every_listener() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add(counting(&calls), None);
        registry.add(counting(&calls), None);
        registry.add(counting(&calls), None);

        assert_eq!(registry.notify_all("test"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_fan_out() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.add(Arc::new(|| panic!("entity blew up")), None);
        registry.add(counting(&calls), None);

        assert_eq!(registry.notify_all("test"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Panicking listener stays registered
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_listener_may_remove_itself_during_fan_out() {
        let registry = Arc::new(ListenerRegistry::new());
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));

        let reg = Arc::clone(&registry);
        let slot = Arc::clone(&own_id);
        let (id, _) = registry.add(
            Arc::new(move || {
                if let Some(id) = *slot.lock().unwrap() {
                    reg.remove(id);
                }
            }),
            None,
        );
        *own_id.lock().unwrap() = Some(id);

        registry.notify_all("test");
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_contexts_are_distinct_and_ordered() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add(counting(&calls), Some("indoor".into()));
        registry.add(counting(&calls), None);
        registry.add(counting(&calls), Some("outdoor".into()));
        registry.add(counting(&calls), Some("indoor".into()));

        assert_eq!(registry.contexts(), vec!["indoor", "outdoor"]);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
