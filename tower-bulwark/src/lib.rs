//! # Tower Bulwark
//!
//! `tower-bulwark` is a resilient request layer for HTTP API clients, built from
//! [Tower](https://github.com/tower-rs/tower) middleware over the stores in
//! [`bulwark`].
//!
//! ## The Client Stack
//! [`Client`] wraps any transport `Service<ApiRequest, Response = ApiResponse>` in:
//!
//! 1. **Supersession**: a newer read with the same cancellation key fails the older
//!    one with `BulwarkError::Superseded`.
//! 2. **Read-through cache**: successful reads are cached with a TTL; successful
//!    mutations invalidate everything under their path.
//! 3. **Deadline**: an overall timeout covering queueing, attempts and backoff.
//! 4. **Keyed rate limiting**: sliding-window admission with a FIFO queue per key;
//!    server 429s requeue the call until the `Retry-After` hint has passed.
//! 5. **Retry**: idempotent calls that failed transiently are retried with capped
//!    exponential backoff and jitter.
//! 6. **Status classification**: failure statuses and raw transport errors become
//!    a cloneable [`BulwarkError`].
//!
//! Each layer is also usable on its own, see [`ServiceBuilderExt`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use tower::BoxError;
//! use tower::service_fn;
//! use tower_bulwark::ApiRequest;
//! use tower_bulwark::ApiResponse;
//! use tower_bulwark::Client;
//! use tower_bulwark::ClientConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = service_fn(|req: ApiRequest| async move {
//!     Ok::<_, BoxError>(ApiResponse::ok(format!("hello from {}", req.path)))
//! });
//! let client = Client::new(ClientConfig::default(), transport)?;
//!
//! let first = client.get("/rooms").await?;
//! let second = client.get("/rooms").await?; // served from the cache
//! assert_eq!(first.body, second.body);
//! # Ok(())
//! # }
//! ```

mod cache_layer;
mod cache_service;
mod cancel_layer;
mod cancel_service;
mod client;
mod config;
mod error;
mod events;
mod layer;
mod limiter;
mod request;
mod retry_layer;
mod retry_service;
mod service;
mod timeout;
mod transport;
mod utils;


pub use cache_layer::CacheLayer;
pub use cache_layer::DEFAULT_TTL;
pub use cache_service::CacheService;
pub use cancel_layer::SupersedeLayer;
pub use cancel_service::SupersedeService;
pub use client::Client;
pub use client::ClientBuilder;
pub use config::CacheConfig;
pub use config::CancellationConfig;
pub use config::ClientConfig;
pub use config::ConfigError;
pub use config::RateLimitConfig;
pub use config::RetryConfig;
pub use config::WindowConfig;
pub use error::BulwarkError;
pub use error::CallError;
pub use error::ErrorKind;
pub use events::Events;
pub use events::Observer;
pub use events::RateLimitCause;
pub use events::RateLimitEvent;
pub use events::RetryEvent;
pub use layer::RateLimitLayer;
pub use limiter::Call;
pub use limiter::RateLimiter;
pub use request::ApiRequest;
pub use request::ApiResponse;
pub use request::CacheContext;
pub use request::CacheOptions;
pub use request::CallOptions;
pub use request::CallTrace;
pub use request::CancelOptions;
pub use request::RateLimitOptions;
pub use request::ResponseSource;
pub use request::RetryIf;
pub use request::RetryOptions;
pub use request::ShouldCache;
pub use request::is_mutation;
pub use retry_layer::RETRYABLE_STATUSES;
pub use retry_layer::RetryLayer;
pub use retry_layer::RetryPolicy;
pub use retry_layer::default_eligible;
pub use retry_service::RetryService;
pub use service::RateLimitService;
pub use timeout::TimeoutLayer;
pub use timeout::TimeoutService;
pub use transport::ClassifyLayer;
pub use transport::ClassifyService;
pub use utils::ServiceBuilderExt;
