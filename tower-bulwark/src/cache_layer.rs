use std::sync::Arc;
use std::time::Duration;

use bulwark::CacheStore;
use tower::Layer;

use crate::cache_service::CacheService;
use crate::events::Events;
use crate::request::ApiResponse;

/// Default time-to-live for cached reads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Serves reads from a [`CacheStore`] and invalidates it on successful mutations.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    store: Arc<CacheStore<ApiResponse>>,
    default_ttl: Duration,
    read_through: bool,
    events: Events,
}

impl CacheLayer {
    pub fn new(store: Arc<CacheStore<ApiResponse>>) -> Self {
        Self {
            store,
            default_ttl: DEFAULT_TTL,
            read_through: true,
            events: Events::default(),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// With `false`, reads go straight through and nothing is stored. Successful
    /// mutations are still announced to observers.
    pub fn with_read_through(mut self, read_through: bool) -> Self {
        self.read_through = read_through;
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            store: Arc::clone(&self.store),
            default_ttl: self.default_ttl,
            read_through: self.read_through,
            events: self.events.clone(),
        }
    }
}
