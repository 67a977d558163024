use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::key::CacheKey;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    payload: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// What to drop from a [`CacheStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Exactly this key.
    Key(CacheKey),
    /// Every key under this resource path (see [`CacheKey::is_under`]).
    Prefix(String),
}

/// A TTL cache of prior successful reads.
///
/// An entry is valid iff `now - stored_at < ttl`. Expired entries are never
/// returned, even before [`sweep`](CacheStore::sweep) has physically removed them.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    max_entries: Option<NonZeroUsize>,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: None,
        }
    }
}

impl<V: Clone> CacheStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the store; when full, storing a new key evicts the oldest entry.
    pub fn with_max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<V> {
        self.lookup_at(key, Instant::now())
    }

    pub fn lookup_at(&self, key: &CacheKey, now: Instant) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_valid_at(now) {
            debug!(%key, "cache hit");
            Some(entry.payload.clone())
        } else {
            debug!(%key, "cache entry expired");
            None
        }
    }

    /// The last valid payload for `key` together with its age.
    ///
    /// Used to serve something when a live attempt failed and the caller asked
    /// for a fallback.
    pub fn fallback(&self, key: &CacheKey) -> Option<(V, Duration)> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        entry
            .is_valid_at(now)
            .then(|| (entry.payload.clone(), now.saturating_duration_since(entry.stored_at)))
    }

    pub fn store(&self, key: CacheKey, payload: V, ttl: Duration) {
        self.store_at(key, payload, ttl, Instant::now());
    }

    pub fn store_at(&self, key: CacheKey, payload: V, ttl: Duration, now: Instant) {
        if let Some(max) = self.max_entries
            && self.entries.len() >= max.get()
            && !self.entries.contains_key(&key)
        {
            self.evict_oldest();
        }
        debug!(%key, ttl_ms = ttl.as_millis() as u64, "cache store");
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                stored_at: now,
                ttl,
            },
        );
    }

    fn evict_oldest(&self) {
        // Collect the key first so no shard guard is held across the remove.
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            debug!(%key, "cache evict");
            self.entries.remove(&key);
        }
    }

    /// Remove matching entries, returning how many were dropped.
    pub fn invalidate(&self, what: &Invalidation) -> usize {
        let removed = match what {
            Invalidation::Key(key) => usize::from(self.entries.remove(key).is_some()),
            Invalidation::Prefix(prefix) => {
                let before = self.entries.len();
                self.entries.retain(|key, _| !key.is_under(prefix));
                before.saturating_sub(self.entries.len())
            }
        };
        debug!(?what, removed, "cache invalidate");
        removed
    }

    /// Physically remove every expired entry, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> {
    /// Sweep on a fixed period, independent of traffic.
    ///
    /// The task holds only a weak reference: it stops once the store is dropped,
    /// or when the returned handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let store: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        });
        SweeperHandle(handle)
    }
}

/// Aborts the background sweeper when dropped.
#[derive(Debug)]
pub struct SweeperHandle(JoinHandle<()>);

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::Method;
    use tokio::time::advance;
    use tokio::time::pause;

    fn key(path: &str) -> CacheKey {
        CacheKey::derive(&Method::GET, path, None, None)
    }

    #[tokio::test]
    async fn entries_expire_exactly_at_ttl() {
        pause();
        let store = CacheStore::new();
        store.store(key("/rooms"), "payload", Duration::from_millis(5000));

        advance(Duration::from_millis(4999)).await;
        assert_eq!(store.lookup(&key("/rooms")), Some("payload"));

        advance(Duration::from_millis(2)).await;
        assert_eq!(store.lookup(&key("/rooms")), None);
        // Logically absent but not yet physically removed.
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn a_newer_store_overwrites() {
        pause();
        let store = CacheStore::new();
        store.store(key("/rooms"), 1, Duration::from_secs(1));
        advance(Duration::from_millis(900)).await;
        store.store(key("/rooms"), 2, Duration::from_secs(1));
        advance(Duration::from_millis(900)).await;

        assert_eq!(store.lookup(&key("/rooms")), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sweeping_twice_is_idempotent() {
        pause();
        let store = CacheStore::new();
        store.store(key("/a"), 'a', Duration::from_millis(100));
        store.store(key("/b"), 'b', Duration::from_millis(300));
        store.store(key("/c"), 'c', Duration::from_millis(300));
        advance(Duration::from_millis(200)).await;

        assert_eq!(store.sweep(), 1);
        let mut first: Vec<_> = store.entries.iter().map(|e| e.key().clone()).collect();
        first.sort();

        assert_eq!(store.sweep(), 0);
        let mut second: Vec<_> = store.entries.iter().map(|e| e.key().clone()).collect();
        second.sort();

        assert_eq!(first, second);
        assert_eq!(first, vec![key("/b"), key("/c")]);
    }

    #[test]
    fn prefix_invalidation_only_hits_the_resource() {
        let store = CacheStore::new();
        let ttl = Duration::from_secs(60);
        store.store(key("/users"), 0, ttl);
        store.store(key("/users/1"), 1, ttl);
        store.store(
            CacheKey::derive(&Method::GET, "/users/1/bookings", Some(&serde_json::json!({"p": 1})), None),
            2,
            ttl,
        );
        store.store(key("/usersettings"), 3, ttl);
        store.store(key("/rooms"), 4, ttl);

        assert_eq!(store.invalidate(&Invalidation::Prefix("/users/1".into())), 2);
        assert!(store.contains(&key("/users")));
        assert!(store.contains(&key("/usersettings")));

        assert_eq!(store.invalidate(&Invalidation::Key(key("/rooms"))), 1);
        assert_eq!(store.invalidate(&Invalidation::Key(key("/rooms"))), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn fallback_reports_age_of_a_valid_entry() {
        pause();
        let store = CacheStore::new();
        store.store(key("/rooms"), "cached", Duration::from_secs(10));
        advance(Duration::from_secs(3)).await;

        assert_eq!(
            store.fallback(&key("/rooms")),
            Some(("cached", Duration::from_secs(3)))
        );
        advance(Duration::from_secs(7)).await;
        assert_eq!(store.fallback(&key("/rooms")), None);
    }

    #[tokio::test]
    async fn a_full_store_evicts_the_oldest_entry() {
        pause();
        let store = CacheStore::new().with_max_entries(NonZeroUsize::new(2).unwrap());
        let ttl = Duration::from_secs(60);
        store.store(key("/a"), 'a', ttl);
        advance(Duration::from_millis(1)).await;
        store.store(key("/b"), 'b', ttl);
        advance(Duration::from_millis(1)).await;
        // Overwriting an existing key never evicts.
        store.store(key("/a"), 'A', ttl);
        assert_eq!(store.len(), 2);

        store.store(key("/c"), 'c', ttl);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&key("/b")));
        assert_eq!(store.lookup(&key("/a")), Some('A'));
    }

    #[tokio::test]
    async fn the_sweeper_runs_without_traffic() {
        pause();
        let store = Arc::new(CacheStore::new());
        let _sweeper = store.spawn_sweeper(Duration::from_secs(1));
        store.store(key("/a"), 'a', Duration::from_millis(500));
        // Let the sweeper start its ticker at t=0.
        tokio::task::yield_now().await;

        advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
    }
}
