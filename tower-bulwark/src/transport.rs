use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::BulwarkError;
use crate::request::ApiRequest;
use crate::request::ApiResponse;

/// Turns HTTP failure statuses and raw transport errors into [`BulwarkError`]s.
///
/// Sits directly on the transport so every layer above it sees a single error
/// vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyLayer;

impl ClassifyLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ClassifyLayer {
    type Service = ClassifyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClassifyService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyService<S> {
    inner: S,
}

pin_project! {
    pub struct ClassifyFuture<F> {
        #[pin]
        inner: F,
    }
}

impl<F, E> Future for ClassifyFuture<F>
where
    F: Future<Output = Result<ApiResponse, E>>,
    E: Into<BoxError>,
{
    type Output = Result<ApiResponse, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(response)) => Poll::Ready(classify(response)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(into_transport(err.into()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn classify(response: ApiResponse) -> Result<ApiResponse, BoxError> {
    if response.status.as_u16() < 400 {
        return Ok(response);
    }
    let retry_after = response.retry_after();
    Err(Box::new(BulwarkError::Status {
        status: response.status,
        retry_after,
        body: response.body,
    }))
}

fn into_transport(err: BoxError) -> BoxError {
    if err.is::<BulwarkError>() {
        err
    } else {
        Box::new(BulwarkError::transport(err))
    }
}

impl<S> Service<ApiRequest> for ClassifyService<S>
where
    S: Service<ApiRequest, Response = ApiResponse>,
    S::Error: Into<BoxError>,
{
    type Response = ApiResponse;
    type Error = BoxError;
    type Future = ClassifyFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|err| into_transport(err.into()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        req.trace.record_attempt();
        ClassifyFuture {
            inner: self.inner.call(req),
        }
    }
}
