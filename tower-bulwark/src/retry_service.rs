use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tracing::debug;
use tracing::warn;

use crate::error::BulwarkError;
use crate::events::Events;
use crate::events::RetryEvent;
use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::retry_layer::RetryPolicy;

/// Per-call retry bookkeeping; never shared between calls.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    max_attempts: u32,
    last_error: Option<BulwarkError>,
}

impl RetryState {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_error: None,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

pub struct RetryService<S> {
    pub(crate) inner: S,
    pub(crate) policy: RetryPolicy,
    pub(crate) events: Events,
}

impl<S: Clone> Clone for RetryService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S> Service<ApiRequest> for RetryService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ApiResponse, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let events = self.events.clone();

        Box::pin(async move {
            let mut state = RetryState::new(policy.attempts_for(&req));
            loop {
                state.attempt += 1;

                let err = match inner.ready().await?.call(req.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };

                // The error goes back unchanged; only a classified one can be retried.
                let Some(failure) = BulwarkError::peek(&err) else {
                    return Err(err);
                };
                if state.exhausted() || !policy.should_retry(&req, failure) {
                    if state.last_error.is_some() {
                        debug!(
                            method = %req.method,
                            path = %req.path,
                            attempts = state.attempt,
                            error = %failure,
                            "giving up after retries"
                        );
                    }
                    return Err(err);
                }

                let delay = policy
                    .backoff()
                    .delay(state.attempt)
                    .max(failure.retry_after().unwrap_or_default());
                warn!(
                    method = %req.method,
                    path = %req.path,
                    attempt = state.attempt,
                    max_attempts = state.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "retrying request"
                );
                events.retry_attempt(&RetryEvent {
                    request: &req,
                    attempt: state.attempt,
                    delay,
                    error: failure,
                });
                state.last_error = Some(failure.clone());

                tokio::time::sleep(delay).await;
            }
        })
    }
}
