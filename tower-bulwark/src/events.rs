use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tracing::warn;

use crate::error::BulwarkError;
use crate::request::ApiRequest;
use crate::request::ApiResponse;

/// Why a call was held back by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitCause {
    /// The local sliding window was full.
    Window,
    /// The server answered 429.
    Server,
}

#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub request: &'a ApiRequest,
    /// Failed attempts so far; also the number of the retry about to be made.
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a BulwarkError,
}

#[derive(Debug)]
pub struct RateLimitEvent<'a> {
    pub key: &'a str,
    pub requeues: u32,
    pub retry_after: Duration,
    pub cause: RateLimitCause,
}

/// Hooks for observing the request layer.
///
/// Every method has an empty default. Observers run inline on the request path,
/// so they should be quick; a panic is caught and logged.
pub trait Observer: Send + Sync {
    /// A mutation succeeded and its cache invalidation has run.
    fn on_success(&self, _request: &ApiRequest, _response: &ApiResponse) {}

    /// Fired before each backoff sleep.
    fn on_retry_attempt(&self, _event: &RetryEvent<'_>) {}

    /// A call was queued or requeued.
    fn on_rate_limited(&self, _event: &RateLimitEvent<'_>) {}

    /// A call was replaced by a newer one with the same key.
    fn on_superseded(&self, _key: &str) {}
}

#[derive(Clone, Debug)]
struct EventMetrics {
    cache_hits: Counter<u64>,
    cache_misses: Counter<u64>,
    retry_attempts: Counter<u64>,
    queued: Counter<u64>,
    requeues: Counter<u64>,
    superseded: Counter<u64>,
}

/// Fan-out point for observers and metrics, shared by every layer of a client.
#[derive(Clone)]
pub struct Events {
    observers: Arc<Vec<Arc<dyn Observer>>>,
    instruments: EventMetrics,
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Events {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        let meter = global::meter("bulwark");
        let instruments = EventMetrics {
            cache_hits: meter.u64_counter("bulwark.cache.hits").build(),
            cache_misses: meter.u64_counter("bulwark.cache.misses").build(),
            retry_attempts: meter.u64_counter("bulwark.retry.attempts").build(),
            queued: meter.u64_counter("bulwark.rate_limit.queued").build(),
            requeues: meter.u64_counter("bulwark.rate_limit.requeues").build(),
            superseded: meter.u64_counter("bulwark.superseded").build(),
        };
        Self {
            observers: Arc::new(observers),
            instruments,
        }
    }

    fn notify(&self, hook: &'static str, f: impl Fn(&dyn Observer)) {
        for observer in self.observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                warn!(hook, "observer panicked; ignoring");
            }
        }
    }

    pub(crate) fn cache_hit(&self, path: &str) {
        self.instruments
            .cache_hits
            .add(1, &[KeyValue::new("path", path.to_string())]);
    }

    pub(crate) fn cache_miss(&self, path: &str) {
        self.instruments
            .cache_misses
            .add(1, &[KeyValue::new("path", path.to_string())]);
    }

    pub(crate) fn success(&self, request: &ApiRequest, response: &ApiResponse) {
        self.notify("on_success", |o| o.on_success(request, response));
    }

    pub(crate) fn retry_attempt(&self, event: &RetryEvent<'_>) {
        self.instruments
            .retry_attempts
            .add(1, &[KeyValue::new("method", event.request.method.to_string())]);
        self.notify("on_retry_attempt", |o| o.on_retry_attempt(event));
    }

    pub(crate) fn rate_limited(&self, event: &RateLimitEvent<'_>) {
        let attrs = [KeyValue::new("key", event.key.to_string())];
        match event.cause {
            RateLimitCause::Window => self.instruments.queued.add(1, &attrs),
            RateLimitCause::Server => self.instruments.requeues.add(1, &attrs),
        }
        self.notify("on_rate_limited", |o| o.on_rate_limited(event));
    }

    pub(crate) fn superseded(&self, key: &str) {
        self.instruments
            .superseded
            .add(1, &[KeyValue::new("key", key.to_string())]);
        self.notify("on_superseded", |o| o.on_superseded(key));
    }
}
