use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;

use crate::limiter::Call;
use crate::limiter::RateLimiter;
use crate::request::ApiRequest;
use crate::request::ApiResponse;

/// Routes each call through a shared [`RateLimiter`].
///
/// Readiness is always reported: waiting for capacity happens per call inside
/// the limiter queue, so one throttled key never stalls calls for another.
#[derive(Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S: Clone> Clone for RateLimitService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<S> RateLimitService<S> {
    pub fn new(inner: S, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl<S> Service<ApiRequest> for RateLimitService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ApiResponse, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let inner = self.inner.clone();

        if !req.options.rate_limit.enabled {
            return Box::pin(inner.oneshot(req));
        }

        let limiter = Arc::clone(&self.limiter);
        let key = limiter.resolve_key(&req.path, req.options.rate_limit.key.as_deref());
        let trace = req.trace.clone();
        let call = Call::new(trace, move || inner.clone().oneshot(req.clone()).boxed());

        Box::pin(async move { limiter.admit_or_queue(key, call).await })
    }
}
