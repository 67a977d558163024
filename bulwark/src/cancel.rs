use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
struct Slot {
    id: u64,
    abort: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Inner {
    slots: DashMap<String, Slot>,
    next_id: AtomicU64,
}

/// Tracks one outstanding call per logical key.
///
/// [`register`](CancellationRegistry::register) installs a fresh slot for a key. If
/// the key already had one, its signal is aborted before the new registration is
/// returned. The replacement happens inside a single map entry, so two racing
/// registrations can never both survive.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Inner>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>) -> Registration {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort, signal) = watch::channel(false);

        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(Slot { id, abort });
                previous.abort.send_replace(true);
                debug!(%key, superseded = previous.id, id, "cancellation slot replaced");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { id, abort });
                debug!(%key, id, "cancellation slot registered");
            }
        }

        Registration {
            key,
            id,
            signal: AbortSignal { signal },
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Abort whatever is in flight for `key` without registering a successor.
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.slots.remove(key) {
            Some((_, slot)) => {
                slot.abort.send_replace(true);
                debug!(%key, id = slot.id, "cancellation slot cancelled");
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.inner.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }
}

/// The live registration of one call. Dropping it releases the slot, unless a
/// newer registration has already taken the key over.
#[derive(Debug)]
pub struct Registration {
    key: String,
    id: u64,
    signal: AbortSignal,
    registry: Weak<Inner>,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.slots.remove_if(&self.key, |_, slot| slot.id == self.id);
        }
    }
}

/// Observes whether a call has been superseded or cancelled.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    signal: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once the signal is aborted. Never resolves for a call that
    /// settles normally.
    pub async fn aborted(&self) {
        let mut signal = self.signal.clone();
        if signal.wait_for(|aborted| *aborted).await.is_err() {
            // Released without being aborted.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::FutureExt;

    #[test]
    fn registering_an_idle_key_aborts_nothing() {
        let registry = CancellationRegistry::new();
        let first = registry.register("GET /search");
        assert!(!first.is_aborted());
        assert!(registry.in_flight("GET /search"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn a_newer_registration_aborts_the_previous_one() {
        let registry = CancellationRegistry::new();
        let first = registry.register("GET /search");
        let second = registry.register("GET /search");

        assert!(first.is_aborted());
        assert!(!second.is_aborted());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn a_settling_predecessor_leaves_the_successor_slot_alone() {
        let registry = CancellationRegistry::new();
        let first = registry.register("k");
        let second = registry.register("k");

        drop(first);
        assert!(registry.in_flight("k"));

        drop(second);
        assert!(!registry.in_flight("k"));
        assert!(registry.is_empty());

        // The key is idle again, so a new call aborts nothing.
        let third = registry.register("k");
        assert!(!third.is_aborted());
    }

    #[test]
    fn keys_are_independent() {
        let registry = CancellationRegistry::new();
        let a = registry.register("a");
        let _b = registry.register("b");
        assert!(!a.is_aborted());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn cancel_aborts_without_a_successor() {
        let registry = CancellationRegistry::new();
        let first = registry.register("k");

        assert!(registry.cancel("k"));
        assert!(first.is_aborted());
        assert!(!registry.in_flight("k"));
        assert!(!registry.cancel("k"));
    }

    #[tokio::test]
    async fn the_signal_future_resolves_on_abort_only() {
        let registry = CancellationRegistry::new();
        let first = registry.register("k");
        let signal = first.signal();

        assert!(signal.aborted().now_or_never().is_none());

        let _second = registry.register("k");
        signal.aborted().await;
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn a_released_signal_never_resolves() {
        let registry = CancellationRegistry::new();
        let first = registry.register("k");
        let signal = first.signal();
        drop(first);

        assert!(signal.aborted().now_or_never().is_none());
        assert!(!signal.is_aborted());
    }
}
