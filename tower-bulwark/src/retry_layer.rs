use std::fmt;

use bulwark::Backoff;
use bulwark::is_idempotent;
use http::Method;
use http::StatusCode;
use tower::Layer;

use crate::error::BulwarkError;
use crate::events::Events;
use crate::request::ApiRequest;
use crate::request::RetryIf;
use crate::retry_service::RetryService;

/// Statuses worth another attempt by default.
pub const RETRYABLE_STATUSES: [StatusCode; 6] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// How often and how patiently to retry transient failures.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retry_if: Option<RetryIf>,
    defer_rate_limited: bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_if", &self.retry_if.is_some())
            .field("defer_rate_limited", &self.defer_rate_limited)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; it is clamped to at least one.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_if: None,
            defer_rate_limited: false,
        }
    }

    /// Replace the default eligibility rule for every call.
    pub fn with_retry_if(mut self, retry_if: RetryIf) -> Self {
        self.retry_if = Some(retry_if);
        self
    }

    /// Leave 429 responses to the rate limiter's requeue path. Calls that opted
    /// out of rate limiting keep retrying them.
    pub fn with_defer_rate_limited(mut self, defer: bool) -> Self {
        self.defer_rate_limited = defer;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Attempts allowed for this particular call.
    pub fn attempts_for(&self, req: &ApiRequest) -> u32 {
        let retry = &req.options.retry;
        if !retry.enabled {
            return 1;
        }
        match retry.max_retries {
            Some(max_retries) => max_retries.saturating_add(1),
            None => self.max_attempts,
        }
    }

    /// Whether `err` on `req` deserves another attempt, ignoring the attempt budget.
    pub fn should_retry(&self, req: &ApiRequest, err: &BulwarkError) -> bool {
        if self.defer_rate_limited && req.options.rate_limit.enabled && err.is_server_rate_limit() {
            return false;
        }
        if let Some(retry_if) = &req.options.retry.retry_if {
            return retry_if(err);
        }
        if let Some(retry_if) = &self.retry_if {
            return retry_if(err);
        }
        default_eligible(&req.method, err)
    }
}

/// Idempotent methods, failing with no response or a transient status.
pub fn default_eligible(method: &Method, err: &BulwarkError) -> bool {
    if !is_idempotent(method) {
        return false;
    }
    match err {
        BulwarkError::Transport { .. } => true,
        BulwarkError::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
        _ => false,
    }
}

/// Retries transient failures with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
    events: Events,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            events: Events::default(),
        }
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            events: self.events.clone(),
        }
    }
}
