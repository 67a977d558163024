//! # bulwark
//!
//! `bulwark` provides the in-memory stores behind a resilient HTTP request layer.
//! Nothing here knows about `tower`: each store is a plain, explicitly constructed
//! value that can be shared via `Arc` and tested in isolation.
//!
//! ## Stores
//!
//! * [`CacheStore`]: TTL cache of prior read responses, keyed by a canonical [`CacheKey`].
//! * [`SlidingLog`] / [`KeyedWindows`]: exact sliding-window admission per key, with an
//!   optional global window that must also admit.
//! * [`Backoff`]: capped exponential backoff with jitter.
//! * [`CancellationRegistry`]: one outstanding call per key; registering a newer call
//!   aborts the older one.
//!
//! ## Concurrency
//!
//! Every check-then-mutate sequence is atomic. The sliding log appends under the same
//! lock it counts under, and the cancellation registry replaces a slot inside a single
//! `DashMap` entry.
//!
//! ## Example
//!
//! ```rust
//! use bulwark::SlidingLog;
//! use bulwark::Strategy;
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let log = SlidingLog::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(1));
//!
//! assert!(log.process().is_continue());
//! assert!(log.process().is_continue());
//! assert!(log.process().is_break());
//! # }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod backoff;
mod cache;
mod cancel;
mod key;
mod keyed;
mod window;

pub use backoff::Backoff;
pub use backoff::is_idempotent;
pub use backoff::is_read_only;
pub use cache::CacheStore;
pub use cache::Invalidation;
pub use cache::SweeperHandle;
pub use cancel::AbortSignal;
pub use cancel::CancellationRegistry;
pub use cancel::Registration;
pub use key::CacheKey;
pub use key::canonicalize;
pub use keyed::GLOBAL_KEY;
pub use keyed::KeyedWindows;
pub use keyed::WindowSpec;
pub use window::SlidingLog;

/// Reasons why a request might be refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The window already holds its maximum number of admissions.
    Overloaded { retry_after: Duration },
    /// The server asked us to back off; nothing is admitted until the hint elapses.
    Deferred { retry_after: Duration },
}

impl Reason {
    /// How long until a retry might be admitted.
    pub fn retry_after(&self) -> Duration {
        match self {
            Reason::Overloaded { retry_after } | Reason::Deferred { retry_after } => *retry_after,
        }
    }
}

/// The core trait for admission strategies.
///
/// Strategies must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Strategy: Debug {
    /// Attempts to admit a single request now.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the request may not be admitted yet.
    fn process(&self) -> ControlFlow<Reason>;
}
