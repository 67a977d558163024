use std::sync::Arc;
use std::time::Duration;

use bulwark::CacheStore;
use bulwark::CancellationRegistry;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::cache_layer::CacheLayer;
use crate::cancel_layer::SupersedeLayer;
use crate::layer::RateLimitLayer;
use crate::limiter::RateLimiter;
use crate::request::ApiResponse;
use crate::retry_layer::RetryLayer;
use crate::retry_layer::RetryPolicy;
use crate::timeout::TimeoutLayer;
use crate::transport::ClassifyLayer;

/// Service Builder Extension with the Bulwark layers for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Serve reads from `store`, invalidating it on successful mutations.
    fn read_through_cache(
        self,
        store: Arc<CacheStore<ApiResponse>>,
        default_ttl: Duration,
    ) -> ServiceBuilder<Stack<CacheLayer, L>>;

    /// Retry transient failures.
    fn retry_transient(self, policy: RetryPolicy) -> ServiceBuilder<Stack<RetryLayer, L>>;

    /// Admit calls through a keyed sliding-window limiter.
    fn keyed_rate_limit(
        self,
        limiter: Arc<RateLimiter>,
    ) -> ServiceBuilder<Stack<RateLimitLayer, L>>;

    /// Supersede older in-flight calls that share a cancellation key.
    fn supersede(self, registry: CancellationRegistry) -> ServiceBuilder<Stack<SupersedeLayer, L>>;

    /// Fail calls that run past `timeout`, unless they carry their own.
    fn deadline(self, timeout: Option<Duration>) -> ServiceBuilder<Stack<TimeoutLayer, L>>;

    /// Map HTTP failure statuses and raw transport errors into `BulwarkError`.
    fn classify_status(self) -> ServiceBuilder<Stack<ClassifyLayer, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn read_through_cache(
        self,
        store: Arc<CacheStore<ApiResponse>>,
        default_ttl: Duration,
    ) -> ServiceBuilder<Stack<CacheLayer, L>> {
        self.layer(CacheLayer::new(store).with_default_ttl(default_ttl))
    }

    fn retry_transient(self, policy: RetryPolicy) -> ServiceBuilder<Stack<RetryLayer, L>> {
        self.layer(RetryLayer::new(policy))
    }

    fn keyed_rate_limit(
        self,
        limiter: Arc<RateLimiter>,
    ) -> ServiceBuilder<Stack<RateLimitLayer, L>> {
        self.layer(RateLimitLayer::new(limiter))
    }

    fn supersede(self, registry: CancellationRegistry) -> ServiceBuilder<Stack<SupersedeLayer, L>> {
        self.layer(SupersedeLayer::new(registry))
    }

    fn deadline(self, timeout: Option<Duration>) -> ServiceBuilder<Stack<TimeoutLayer, L>> {
        self.layer(TimeoutLayer::new(timeout))
    }

    fn classify_status(self) -> ServiceBuilder<Stack<ClassifyLayer, L>> {
        self.layer(ClassifyLayer::new())
    }
}
