use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Timeout;
use tokio::time::timeout;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::BulwarkError;
use crate::request::ApiRequest;

// Effective infinity
const FOREVER: Duration = Duration::from_secs(3600 * 24 * 365);

/// An overall deadline covering queue wait, every attempt and every backoff sleep.
///
/// A call's own `timeout` option takes precedence over the layer's.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer {
    timeout: Option<Duration>,
}

impl TimeoutLayer {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Option<Duration>,
}

pin_project! {
    /// A future that wraps the inner service future with a deadline.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Timeout<F>,
        started: Instant,
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Box::new(BulwarkError::Timeout {
                elapsed: this.started.elapsed(),
            }))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Service<ApiRequest> for TimeoutService<S>
where
    S: Service<ApiRequest, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let deadline = req.options.timeout.or(self.timeout).unwrap_or(FOREVER);
        ResponseFuture {
            inner: timeout(deadline, self.inner.call(req)),
            started: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tower::ServiceExt;
    use tower::service_fn;

    use crate::error::ErrorKind;
    use crate::request::ApiResponse;

    async fn slow(_req: ApiRequest) -> Result<ApiResponse, BoxError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ApiResponse::ok("late"))
    }

    #[tokio::test(start_paused = true)]
    async fn the_deadline_fails_the_call() {
        let svc = TimeoutLayer::new(Some(Duration::from_secs(2))).layer(service_fn(slow));

        let err = svc.oneshot(ApiRequest::get("/rooms")).await.unwrap_err();
        let err = BulwarkError::from_box(err);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(err, BulwarkError::Timeout { elapsed } if elapsed >= Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn a_per_call_timeout_wins() {
        let svc = TimeoutLayer::new(Some(Duration::from_secs(2))).layer(service_fn(slow));

        let req = ApiRequest::get("/rooms").with_timeout(Duration::from_secs(30));
        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.body, "late");
    }
}
