use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bulwark::CacheKey;
use bulwark::is_read_only;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use http::header::HeaderName;
use http::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BulwarkError;

/// Decides whether a successful read may be stored.
pub type ShouldCache = Arc<dyn Fn(&CacheContext<'_>) -> bool + Send + Sync>;

/// Overrides the default retry eligibility rule.
pub type RetryIf = Arc<dyn Fn(&BulwarkError) -> bool + Send + Sync>;

/// What a [`ShouldCache`] predicate gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CacheContext<'a> {
    pub request: &'a ApiRequest,
    pub response: &'a ApiResponse,
}

#[derive(Clone)]
pub struct CacheOptions {
    /// Use this key instead of the derived one.
    pub key: Option<String>,
    /// Overrides the client's default TTL.
    pub ttl: Option<Duration>,
    pub use_cache: bool,
    pub should_cache: Option<ShouldCache>,
    /// Serve the last valid cached payload if the live attempt fails.
    pub fallback_on_error: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            key: None,
            ttl: None,
            use_cache: true,
            should_cache: None,
            fallback_on_error: false,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("use_cache", &self.use_cache)
            .field("should_cache", &self.should_cache.is_some())
            .field("fallback_on_error", &self.fallback_on_error)
            .finish()
    }
}

#[derive(Clone)]
pub struct RetryOptions {
    /// `false` means exactly one attempt.
    pub enabled: bool,
    /// Retries after the first attempt; overrides the policy's attempt ceiling.
    pub max_retries: Option<u32>,
    pub retry_if: Option<RetryIf>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: None,
            retry_if: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("enabled", &self.enabled)
            .field("max_retries", &self.max_retries)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    /// Queue and count this call under an explicit key.
    pub key: Option<String>,
    pub enabled: bool,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            key: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelOptions {
    pub key: Option<String>,
    /// `None` applies the default: reads take part, mutations do not.
    pub enabled: Option<bool>,
}

/// Per-call configuration, one section per concern.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cache: CacheOptions,
    /// Bypass the cache entirely for this call.
    pub no_cache: bool,
    pub retry: RetryOptions,
    pub rate_limit: RateLimitOptions,
    pub cancel: CancelOptions,
    /// Overrides the client's overall deadline.
    pub timeout: Option<Duration>,
    /// Extra resource paths to invalidate when this mutation succeeds.
    pub invalidate: Vec<String>,
}

#[derive(Debug, Default)]
struct TraceCounters {
    attempts: AtomicU32,
    requeues: AtomicU32,
}

/// Counters shared by every clone of one request, so layers can report how many
/// attempts and requeues a call took.
#[derive(Debug, Clone, Default)]
pub struct CallTrace {
    counters: Arc<TraceCounters>,
}

impl CallTrace {
    pub fn record_attempt(&self) -> u32 {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_requeue(&self) -> u32 {
        self.counters.requeues.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.counters.attempts.load(Ordering::Relaxed)
    }

    pub fn requeues(&self) -> u32 {
        self.counters.requeues.load(Ordering::Relaxed)
    }
}

/// One outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, e.g. `/bookings/7`.
    pub path: String,
    pub params: Option<Value>,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    pub options: CallOptions,
    pub trace: CallTrace,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: None,
            body: None,
            headers: HeaderMap::new(),
            options: CallOptions::default(),
            trace: CallTrace::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.options.no_cache = true;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache.ttl = Some(ttl);
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.options.cache.fallback_on_error = true;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.options.retry.enabled = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.options.retry.max_retries = Some(max_retries);
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.options.rate_limit.key = Some(key.into());
        self
    }

    pub fn with_cancel_key(mut self, key: impl Into<String>) -> Self {
        self.options.cancel.key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn invalidating(mut self, prefix: impl Into<String>) -> Self {
        self.options.invalidate.push(prefix.into());
        self
    }

    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.method)
    }

    pub fn is_mutation(&self) -> bool {
        is_mutation(&self.method)
    }

    /// The explicit cache key if one was given, otherwise the derived one.
    pub fn cache_key(&self) -> CacheKey {
        match &self.options.cache.key {
            Some(key) => CacheKey::explicit(key.clone()),
            None => CacheKey::derive(
                &self.method,
                &self.path,
                self.params.as_ref(),
                self.body.as_ref(),
            ),
        }
    }

    /// The cancellation key this call registers under, if it takes part in
    /// supersession at all.
    ///
    /// By default only an equivalent call (same method, path, parameters and body)
    /// supersedes this one. Callers that want any newer call to win, such as a
    /// search box, share an explicit `cancel.key`.
    pub fn cancel_key(&self) -> Option<String> {
        let participates = self
            .options
            .cancel
            .enabled
            .unwrap_or_else(|| self.is_read_only());
        if !participates {
            return None;
        }
        Some(
            self.options
                .cancel
                .key
                .clone()
                .unwrap_or_else(|| {
                    CacheKey::derive(
                        &self.method,
                        &self.path,
                        self.params.as_ref(),
                        self.body.as_ref(),
                    )
                    .to_string()
                }),
        )
    }
}

/// POST, PUT, PATCH and DELETE change server state; their success invalidates
/// cached reads.
pub fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
    /// A cached payload served because the live attempt failed.
    Fallback { age: Duration },
}

/// The result of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn json(status: StatusCode, value: &Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The `Retry-After` header in its delay-seconds form.
    pub fn retry_after(&self) -> Option<Duration> {
        retry_after(&self.headers)
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}
