use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tower::BoxError;

/// Coarse classification of a [`BulwarkError`], for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Status,
    RateLimited,
    Superseded,
    Timeout,
    Overloaded,
    Inner,
}

/// Errors produced by the Bulwark middleware stack.
///
/// Errors travel through the `tower` stack boxed as [`BoxError`]; downcast with
/// [`BulwarkError::from_box`] or `err.downcast_ref::<BulwarkError>()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BulwarkError {
    /// No response was received.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A response arrived with a status of 400 or above.
    ///
    /// `retry_after` carries the server's `Retry-After` hint, if any.
    #[error("Request failed with status {status}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
        body: Bytes,
    },

    /// The call kept being rate limited and gave up after `requeues` requeues, or
    /// the limiter runs in fail-fast mode.
    #[error("Rate limit exceeded after {requeues} requeues; retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        requeues: u32,
    },

    /// A newer call with the same cancellation key replaced this one.
    ///
    /// Callers are expected to swallow this silently.
    #[error("Request superseded by a newer call")]
    Superseded,

    /// The overall deadline elapsed, including any queueing and retries.
    #[error("Request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The rate limiter queue for this key is full.
    #[error("Rate limit queue is full; request shed")]
    Overloaded,

    /// Any other error raised inside the stack.
    ///
    /// The string contains the `Display` representation of the original error.
    #[error("Internal error: {0}")]
    Inner(String),
}

impl BulwarkError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Status { .. } => ErrorKind::Status,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Superseded => ErrorKind::Superseded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Inner(_) => ErrorKind::Inner,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Any hint about when to try again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }

    /// A 429 from the server.
    pub fn is_server_rate_limit(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS)
    }

    /// Recover a `BulwarkError` from a boxed error. Foreign errors are mapped onto
    /// the nearest variant.
    pub fn from_box(err: BoxError) -> Self {
        match err.downcast::<BulwarkError>() {
            Ok(err) => *err,
            Err(err) if err.is::<tower::timeout::error::Elapsed>() => Self::Timeout {
                elapsed: Duration::ZERO,
            },
            Err(err) if err.is::<tower::load_shed::error::Overloaded>() => Self::Overloaded,
            Err(err) => Self::Inner(err.to_string()),
        }
    }

    /// Borrow the `BulwarkError` inside a boxed error, if that is what it holds.
    pub fn peek(err: &BoxError) -> Option<&BulwarkError> {
        err.downcast_ref::<BulwarkError>()
    }
}

/// A failed call as seen by a collaborator of [`Client`](crate::Client).
///
/// `error` is exactly what the stack produced (a transport error that exhausted
/// its retries is still a `Transport` error); the other fields describe the
/// journey.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct CallError {
    #[source]
    pub error: BulwarkError,
    /// Attempts made against the transport.
    pub attempts: u32,
    /// Times the call was requeued after a server rate-limit response.
    pub requeues: u32,
    pub elapsed: Duration,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.error.status()
    }

    /// Superseded calls should be dropped silently rather than reported.
    pub fn is_superseded(&self) -> bool {
        self.error.is_superseded()
    }
}
