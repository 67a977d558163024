//! Typed client configuration, loaded from TOML.
//!
//! Durations are written in humantime form (`"500ms"`, `"5m"`).
//!
//! ```toml
//! timeout = "30s"
//!
//! [cache]
//! default_ttl = "5m"
//!
//! [retry]
//! max_attempts = 4
//! base_delay = "250ms"
//!
//! [rate_limit]
//! enabled = true
//! global = { max_requests = 50, window = "1s" }
//!
//! [rate_limit.endpoints."/search"]
//! max_requests = 5
//! window = "1s"
//! ```

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use bulwark::Backoff;
use bulwark::KeyedWindows;
use bulwark::WindowSpec;
use serde::Deserialize;
use serde::Deserializer;

use crate::retry_layer::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: `{field}` {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "duration")]
    pub default_ttl: Duration,
    /// How often expired entries are swept out.
    #[serde(deserialize_with = "duration")]
    pub sweep_interval: Duration,
    pub max_entries: Option<NonZeroUsize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Includes the first attempt.
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "duration")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay).with_jitter(self.jitter)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub max_requests: usize,
    #[serde(deserialize_with = "duration")]
    pub window: Duration,
}

impl WindowConfig {
    fn spec(&self, field: &str) -> Result<WindowSpec, ConfigError> {
        let max_requests = NonZeroUsize::new(self.max_requests)
            .ok_or_else(|| ConfigError::invalid(field, "max_requests must be at least 1"))?;
        if self.window.is_zero() {
            return Err(ConfigError::invalid(field, "window must be non-zero"));
        }
        Ok(WindowSpec::new(max_requests, self.window))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global: Option<WindowConfig>,
    /// Windows keyed by path prefix.
    pub endpoints: BTreeMap<String, WindowConfig>,
    pub max_requeues: u32,
    pub queue_capacity: Option<NonZeroUsize>,
    pub fail_fast: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            global: None,
            endpoints: BTreeMap::new(),
            max_requeues: 3,
            queue_capacity: None,
            fail_fast: false,
        }
    }
}

impl RateLimitConfig {
    pub fn windows(&self) -> Result<KeyedWindows, ConfigError> {
        let global = self
            .global
            .as_ref()
            .map(|window| window.spec("rate_limit.global"))
            .transpose()?;
        let mut windows = KeyedWindows::new(global);
        for (prefix, window) in &self.endpoints {
            if !prefix.starts_with('/') {
                return Err(ConfigError::invalid(
                    format!("rate_limit.endpoints.{prefix}"),
                    "prefix must start with '/'",
                ));
            }
            let spec = window.spec(&format!("rate_limit.endpoints.{prefix}"))?;
            windows = windows.with_endpoint(prefix.clone(), spec);
        }
        Ok(windows)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CancellationConfig {
    pub enabled: bool,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Root configuration of a [`Client`](crate::Client).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub cancellation: CancellationConfig,
    /// Overall deadline per call, including queueing and retries.
    #[serde(deserialize_with = "optional_duration")]
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.default_ttl.is_zero() {
            return Err(ConfigError::invalid("cache.default_ttl", "must be non-zero"));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(ConfigError::invalid("cache.sweep_interval", "must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "retry.base_delay",
                "must not exceed retry.max_delay",
            ));
        }
        self.rate_limit.windows()?;
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("timeout", "must be non-zero"));
        }
        Ok(())
    }
}
