//! Capped exponential backoff with jitter.

use std::time::Duration;

use http::Method;
use rand::Rng;

/// `delay(attempt) = min(base * 2^(attempt - 1), max)`, scaled by a jitter factor
/// drawn uniformly from `[0.5, 1.5]`.
///
/// Attempts are 1-indexed; attempt 0 has no delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }
}

impl Backoff {
    pub const JITTER_MIN: f64 = 0.5;
    pub const JITTER_MAX: f64 = 1.5;

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Disable jitter, e.g. for deterministic schedules.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// The unjittered delay before retry number `attempt`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // 2^31 already dwarfs any sane max, and keeps the shift in range.
        let factor = 1u32 << (attempt - 1).min(31);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// The delay to actually sleep before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::rng().random_range(Self::JITTER_MIN..=Self::JITTER_MAX);
        nominal.mul_f64(factor)
    }
}

/// GET, HEAD, PUT, DELETE and OPTIONS may be repeated without changing the effect
/// beyond the first successful application.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

/// Methods whose responses may be cached and whose calls are superseded by default.
pub fn is_read_only(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}
