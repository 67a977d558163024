use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use bulwark::CancellationRegistry;
use tower::BoxError;
use tower::Service;
use tracing::debug;

use crate::error::BulwarkError;
use crate::events::Events;
use crate::request::ApiRequest;

pub struct SupersedeService<S> {
    pub(crate) inner: S,
    pub(crate) registry: CancellationRegistry,
    pub(crate) events: Events,
}

impl<S: Clone> Clone for SupersedeService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S> Service<ApiRequest> for SupersedeService<S>
where
    S: Service<ApiRequest, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let Some(key) = req.cancel_key() else {
            return Box::pin(inner.call(req));
        };

        // Registered before the future is first polled, so a predecessor is
        // aborted as soon as this call is made.
        let registration = self.registry.register(key);
        let events = self.events.clone();
        let fut = inner.call(req);

        Box::pin(async move {
            let signal = registration.signal();
            tokio::select! {
                biased;
                _ = signal.aborted() => {
                    debug!(key = registration.key(), "call superseded");
                    events.superseded(registration.key());
                    Err(Box::new(BulwarkError::Superseded) as BoxError)
                }
                result = fut => result,
            }
        })
    }
}
