//! Small shared helpers: id generation and the listener-registry pattern used
//! by the device, channel and transport layers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generates a UUIDv4 string, used for shared-secret nonces and as a default
/// channel id for application-initiated channels.
pub fn generate_uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Handle returned by [`ListenerRegistry::add`]; pass back to `remove` to
/// unregister. Ids are monotonically increasing within a single registry and
/// are never reused.
pub type ListenerId = u64;

/// An insertion-ordered table of callbacks, indexed by a monotonically
/// assigned id so callers can remove exactly the listener they added.
///
/// Per the device/channel locking model, callers must snapshot the table
/// (via [`ListenerRegistry::snapshot`]) while holding the owning object's
/// lock, then invoke the snapshot after releasing it — no callback stored
/// here should ever run while the lock is held.
pub struct ListenerRegistry<F: ?Sized> {
    next_id: AtomicU64,
    entries: BTreeMap<ListenerId, Arc<F>>,
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: BTreeMap::new(),
        }
    }
}

impl<F: ?Sized> ListenerRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<F>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, listener);
        id
    }

    pub fn remove(&mut self, id: ListenerId) {
        self.entries.remove(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the currently-registered listeners in insertion order, for
    /// dispatch after the owning lock has been released.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_not_reused() {
        let mut reg: ListenerRegistry<dyn Fn() + Send + Sync> = ListenerRegistry::new();
        let a = reg.add(Arc::new(|| {}));
        let b = reg.add(Arc::new(|| {}));
        assert!(b > a);
        reg.remove(a);
        let c = reg.add(Arc::new(|| {}));
        assert!(c > b);
        assert_eq!(reg.snapshot().len(), 2);
    }

    #[test]
    fn snapshot_reflects_removal() {
        let mut reg: ListenerRegistry<dyn Fn() + Send + Sync> = ListenerRegistry::new();
        let a = reg.add(Arc::new(|| {}));
        reg.add(Arc::new(|| {}));
        reg.remove(a);
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn uuid_looks_like_a_uuid() {
        let id = generate_uuid_v4();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|&c| c == '-').count(), 4);
    }
}
