use std::sync::Arc;

use tower::Layer;

use crate::limiter::RateLimiter;
use crate::service::RateLimitService;

/// Applies keyed rate limiting to requests.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    /// Create a RateLimitLayer
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        RateLimitLayer { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService::new(service, Arc::clone(&self.limiter))
    }
}
