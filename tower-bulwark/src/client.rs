use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bulwark::CacheStore;
use bulwark::CancellationRegistry;
use bulwark::Invalidation;
use bulwark::SweeperHandle;
use tokio::time::Instant;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;
use tracing::debug;

use crate::cache_layer::CacheLayer;
use crate::cancel_layer::SupersedeLayer;
use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::error::BulwarkError;
use crate::error::CallError;
use crate::events::Events;
use crate::events::Observer;
use crate::layer::RateLimitLayer;
use crate::limiter::RateLimiter;
use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::request::RetryIf;
use crate::retry_layer::RetryLayer;
use crate::timeout::TimeoutLayer;
use crate::transport::ClassifyLayer;

/// Assembles a [`Client`] from a [`ClientConfig`].
pub struct ClientBuilder {
    config: ClientConfig,
    observers: Vec<Arc<dyn Observer>>,
    retry_if: Option<RetryIf>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
            retry_if: None,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the default retry eligibility rule for every call.
    pub fn retry_if(mut self, retry_if: RetryIf) -> Self {
        self.retry_if = Some(retry_if);
        self
    }

    /// Wrap `transport` in the full stack.
    ///
    /// From the outside in: supersession, cache, deadline, rate limiting, retry,
    /// status classification. The cache sweeper is only started when called from
    /// within a tokio runtime.
    pub fn build<T>(self, transport: T) -> Result<Client, ConfigError>
    where
        T: Service<ApiRequest, Response = ApiResponse> + Clone + Send + Sync + 'static,
        T::Error: Into<BoxError>,
        T::Future: Send + 'static,
    {
        let config = self.config;
        config.validate()?;
        let events = Events::new(self.observers);

        let mut store = CacheStore::new();
        if let Some(max_entries) = config.cache.max_entries {
            store = store.with_max_entries(max_entries);
        }
        let cache = Arc::new(store);
        let registry = CancellationRegistry::new();

        let limiter = if config.rate_limit.enabled {
            let mut limiter = RateLimiter::new(config.rate_limit.windows()?)
                .with_max_requeues(config.rate_limit.max_requeues)
                .with_requeue_backoff(config.retry.backoff())
                .with_fail_fast(config.rate_limit.fail_fast)
                .with_events(events.clone());
            if let Some(capacity) = config.rate_limit.queue_capacity {
                limiter = limiter.with_queue_capacity(capacity);
            }
            Some(Arc::new(limiter))
        } else {
            None
        };

        let mut policy = config
            .retry
            .policy()
            .with_defer_rate_limited(limiter.is_some());
        if let Some(retry_if) = self.retry_if {
            policy = policy.with_retry_if(retry_if);
        }

        let svc = ServiceBuilder::new()
            .option_layer(
                config
                    .cancellation
                    .enabled
                    .then(|| SupersedeLayer::new(registry.clone()).with_events(events.clone())),
            )
            // Always present: with the cache off it still announces mutations.
            .layer(
                CacheLayer::new(Arc::clone(&cache))
                    .with_default_ttl(config.cache.default_ttl)
                    .with_read_through(config.cache.enabled)
                    .with_events(events.clone()),
            )
            .layer(TimeoutLayer::new(config.timeout))
            .option_layer(limiter.clone().map(RateLimitLayer::new))
            .option_layer(
                config
                    .retry
                    .enabled
                    .then(|| RetryLayer::new(policy).with_events(events.clone())),
            )
            .layer(ClassifyLayer::new())
            .service(transport);

        let sweeper = (config.cache.enabled && tokio::runtime::Handle::try_current().is_ok())
            .then(|| Arc::new(cache.spawn_sweeper(config.cache.sweep_interval)));

        debug!(
            cache = config.cache.enabled,
            retry = config.retry.enabled,
            rate_limit = config.rate_limit.enabled,
            cancellation = config.cancellation.enabled,
            "client built"
        );

        Ok(Client {
            service: BoxCloneSyncService::new(svc),
            cache,
            limiter,
            registry,
            _sweeper: sweeper,
        })
    }
}

/// The facade collaborators issue requests through.
///
/// Cloning is cheap and clones share every store. The cache sweeper stops once
/// the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    service: BoxCloneSyncService<ApiRequest, ApiResponse, BoxError>,
    cache: Arc<CacheStore<ApiResponse>>,
    limiter: Option<Arc<RateLimiter>>,
    registry: CancellationRegistry,
    _sweeper: Option<Arc<SweeperHandle>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cached", &self.cache.len())
            .field("limiter", &self.limiter)
            .field("in_flight", &self.registry.len())
            .finish()
    }
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn new<T>(config: ClientConfig, transport: T) -> Result<Self, ConfigError>
    where
        T: Service<ApiRequest, Response = ApiResponse> + Clone + Send + Sync + 'static,
        T::Error: Into<BoxError>,
        T::Future: Send + 'static,
    {
        ClientBuilder::new(config).build(transport)
    }

    /// Issue a request.
    ///
    /// Failures come back as a [`CallError`] carrying the error exactly as the
    /// stack produced it, plus how many attempts and requeues it took.
    pub async fn send(&self, req: ApiRequest) -> Result<ApiResponse, CallError> {
        let trace = req.trace.clone();
        let started = Instant::now();
        self.service
            .clone()
            .oneshot(req)
            .await
            .map_err(|err| CallError {
                error: BulwarkError::from_box(err),
                attempts: trace.attempts(),
                requeues: trace.requeues(),
                elapsed: started.elapsed(),
            })
    }

    pub async fn get(&self, path: impl Into<String>) -> Result<ApiResponse, CallError> {
        self.send(ApiRequest::get(path)).await
    }

    /// What the cache currently holds for `req`, without touching the network.
    pub fn cached(&self, req: &ApiRequest) -> Option<ApiResponse> {
        self.cache.lookup(&req.cache_key())
    }

    pub fn invalidate(&self, what: &Invalidation) -> usize {
        self.cache.invalidate(what)
    }

    /// Admissions left for the limiter key `path` resolves to; `usize::MAX` when
    /// rate limiting is off.
    pub fn remaining(&self, path: &str) -> usize {
        match &self.limiter {
            Some(limiter) => limiter.remaining(&limiter.resolve_key(path, None)),
            None => usize::MAX,
        }
    }

    /// Time until the window for `path` frees a slot.
    pub fn reset_in(&self, path: &str) -> Duration {
        match &self.limiter {
            Some(limiter) => limiter.reset_in(&limiter.resolve_key(path, None)),
            None => Duration::ZERO,
        }
    }

    /// Abort the in-flight call registered under a cancellation key.
    pub fn cancel(&self, key: &str) -> bool {
        self.registry.cancel(key)
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.registry.in_flight(key)
    }

    pub fn cache(&self) -> &Arc<CacheStore<ApiResponse>> {
        &self.cache
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }
}
