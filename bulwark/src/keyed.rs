use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;

use super::Reason;
use super::key::is_under;
use super::window::SlidingLog;

/// Limiter key used when no endpoint window matches a request.
pub const GLOBAL_KEY: &str = "*";

/// Shape of one sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub max_requests: NonZeroUsize,
    pub window: Duration,
}

impl WindowSpec {
    pub fn new(max_requests: NonZeroUsize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// A set of sliding logs: an optional global window plus one window per endpoint
/// prefix.
///
/// A request admitted for an endpoint key must satisfy both that endpoint's window
/// and the global window. Both logs are locked (global first) for the duration of
/// the check so the pair is admitted atomically.
#[derive(Debug, Default)]
pub struct KeyedWindows {
    global: Option<SlidingLog>,
    /// Sorted longest prefix first.
    endpoints: Vec<(String, SlidingLog)>,
}

impl KeyedWindows {
    pub fn new(global: Option<WindowSpec>) -> Self {
        Self {
            global: global.map(|spec| SlidingLog::new(spec.max_requests, spec.window)),
            endpoints: Vec::new(),
        }
    }

    /// Add a window for every path under `prefix`.
    pub fn with_endpoint(mut self, prefix: impl Into<String>, spec: WindowSpec) -> Self {
        let prefix = prefix.into();
        self.endpoints.retain(|(existing, _)| *existing != prefix);
        self.endpoints
            .push((prefix, SlidingLog::new(spec.max_requests, spec.window)));
        self.endpoints
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self
    }

    /// Pick the limiter key for a request: the explicit key if one was given,
    /// otherwise the longest configured endpoint prefix covering `path`,
    /// otherwise [`GLOBAL_KEY`].
    pub fn resolve_key(&self, path: &str, explicit: Option<&str>) -> String {
        if let Some(key) = explicit {
            return key.to_string();
        }
        self.endpoints
            .iter()
            .find(|(prefix, _)| is_under(path, prefix))
            .map(|(prefix, _)| prefix.clone())
            .unwrap_or_else(|| GLOBAL_KEY.to_string())
    }

    fn endpoint(&self, key: &str) -> Option<&SlidingLog> {
        self.endpoints
            .iter()
            .find(|(prefix, _)| prefix == key)
            .map(|(_, log)| log)
    }

    fn involved(&self, key: &str) -> impl Iterator<Item = &SlidingLog> {
        self.global.iter().chain(self.endpoint(key))
    }

    /// Admit a request for `key` at `now` iff every involved window admits it.
    ///
    /// When denied, the reported `retry_after` is the largest of the binding
    /// windows.
    pub fn try_admit_at(&self, key: &str, now: Instant) -> ControlFlow<Reason> {
        let logs: Vec<&SlidingLog> = self.involved(key).collect();
        let mut guards: Vec<_> = logs.iter().map(|log| log.lock()).collect();

        let mut binding: Option<Reason> = None;
        for (guard, log) in guards.iter_mut().zip(&logs) {
            guard.prune(now, log.window());
            if let ControlFlow::Break(reason) = guard.check(now, log.capacity(), log.window())
                && binding.is_none_or(|current| reason.retry_after() > current.retry_after())
            {
                binding = Some(reason);
            }
        }

        match binding {
            Some(reason) => ControlFlow::Break(reason),
            None => {
                for guard in guards.iter_mut() {
                    guard.record(now);
                }
                ControlFlow::Continue(())
            }
        }
    }

    pub fn try_admit(&self, key: &str) -> ControlFlow<Reason> {
        self.try_admit_at(key, Instant::now())
    }

    /// Admissions left for `key`; `usize::MAX` when no window applies.
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        self.involved(key)
            .map(|log| log.remaining_at(now))
            .min()
            .unwrap_or(usize::MAX)
    }

    /// The larger `reset_in` of the windows involved for `key`.
    pub fn reset_in(&self, key: &str) -> Duration {
        let now = Instant::now();
        self.involved(key)
            .map(|log| log.reset_in_at(now))
            .max()
            .unwrap_or_default()
    }

    /// Absorb a server rate-limit signal. The endpoint window for `key` is blocked
    /// if there is one, otherwise the global window.
    pub fn block_until(&self, key: &str, until: Instant) {
        if let Some(log) = self.endpoint(key).or(self.global.as_ref()) {
            log.block_until(until);
        }
    }

    /// Whether any window is configured at all.
    pub fn is_unbounded(&self) -> bool {
        self.global.is_none() && self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::advance;
    use tokio::time::pause;

    fn spec(max: usize, window_ms: u64) -> WindowSpec {
        WindowSpec::new(
            NonZeroUsize::new(max).unwrap(),
            Duration::from_millis(window_ms),
        )
    }

    #[test]
    fn it_resolves_the_longest_matching_prefix() {
        let windows = KeyedWindows::new(None)
            .with_endpoint("/api", spec(10, 1000))
            .with_endpoint("/api/bookings", spec(2, 1000));

        assert_eq!(windows.resolve_key("/api/bookings/7", None), "/api/bookings");
        assert_eq!(windows.resolve_key("/api/rooms", None), "/api");
        assert_eq!(windows.resolve_key("/apiary", None), GLOBAL_KEY);
        assert_eq!(windows.resolve_key("/health", None), GLOBAL_KEY);
        assert_eq!(windows.resolve_key("/api/rooms", Some("search")), "search");
    }

    #[tokio::test]
    async fn admission_requires_both_global_and_endpoint() {
        pause();
        let windows =
            KeyedWindows::new(Some(spec(3, 1000))).with_endpoint("/search", spec(1, 200));

        assert!(windows.try_admit("/search").is_continue());
        // Endpoint window is full; nothing may be charged to the global window.
        assert!(windows.try_admit("/search").is_break());
        assert_eq!(windows.remaining(GLOBAL_KEY), 2);

        assert!(windows.try_admit(GLOBAL_KEY).is_continue());
        assert!(windows.try_admit(GLOBAL_KEY).is_continue());

        // Global is now full, endpoint frees at 200ms but global binds until 1000ms.
        advance(Duration::from_millis(200)).await;
        let denied = windows.try_admit("/search");
        assert_eq!(denied.break_value().map(|r| r.retry_after()), Some(Duration::from_millis(800)));
        assert_eq!(windows.reset_in("/search"), Duration::from_millis(800));
        assert_eq!(windows.remaining("/search"), 0);
    }

    #[test]
    fn no_windows_means_unbounded() {
        let windows = KeyedWindows::default();
        assert!(windows.is_unbounded());
        for _ in 0..1000 {
            assert!(windows.try_admit(GLOBAL_KEY).is_continue());
        }
        assert_eq!(windows.remaining("anything"), usize::MAX);
        assert_eq!(windows.reset_in("anything"), Duration::ZERO);
    }

    #[tokio::test]
    async fn a_block_lands_on_the_endpoint_window() {
        pause();
        let windows =
            KeyedWindows::new(Some(spec(10, 1000))).with_endpoint("/slow", spec(10, 1000));

        windows.block_until("/slow", Instant::now() + Duration::from_secs(2));

        assert!(matches!(
            windows.try_admit("/slow"),
            ControlFlow::Break(Reason::Deferred { .. })
        ));
        assert!(windows.try_admit(GLOBAL_KEY).is_continue());
        assert_eq!(windows.reset_in("/slow"), Duration::from_secs(2));
    }
}
