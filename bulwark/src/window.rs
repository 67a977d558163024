use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::time::Instant;

use super::Reason;
use super::Strategy;

/// An exact sliding-window log.
///
/// Every admission instant inside the trailing window is remembered. A request is
/// admitted iff fewer than `capacity` admissions remain in the window once older
/// entries have been pruned. Unlike a sliding window *counter*, there is no
/// approximation: the count in any trailing window never exceeds `capacity`.
///
/// Pruning is lazy; it happens on every check, so no background timer is needed.
#[derive(Debug)]
pub struct SlidingLog {
    capacity: usize,
    window: Duration,
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
pub(crate) struct LogState {
    timestamps: VecDeque<Instant>,
    /// Set when the server told us to back off.
    blocked_until: Option<Instant>,
}

impl LogState {
    pub(crate) fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// Must be called after `prune`.
    pub(crate) fn check(&self, now: Instant, capacity: usize, window: Duration) -> ControlFlow<Reason> {
        if let Some(until) = self.blocked_until {
            return ControlFlow::Break(Reason::Deferred {
                retry_after: until.saturating_duration_since(now),
            });
        }
        if self.timestamps.len() < capacity {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded {
                retry_after: self.next_slot_in(now, window),
            })
        }
    }

    pub(crate) fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    fn next_slot_in(&self, now: Instant, window: Duration) -> Duration {
        self.timestamps
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn reset_in(&self, now: Instant, window: Duration) -> Duration {
        let blocked = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        blocked.max(self.next_slot_in(now, window))
    }
}

impl SlidingLog {
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            capacity: capacity.get(),
            window,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Prune, check and (on success) append `now`, all under one lock.
    pub fn try_admit_at(&self, now: Instant) -> ControlFlow<Reason> {
        let mut state = self.lock();
        state.prune(now, self.window);
        let outcome = state.check(now, self.capacity, self.window);
        if outcome.is_continue() {
            state.record(now);
        }
        outcome
    }

    /// Admissions still available in the current window.
    pub fn remaining_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        state.prune(now, self.window);
        if state.blocked_until.is_some() {
            return 0;
        }
        self.capacity.saturating_sub(state.timestamps.len())
    }

    /// Time until the oldest admission leaves the window, or until a server
    /// imposed block lifts, whichever is later. Zero for an idle log.
    pub fn reset_in_at(&self, now: Instant) -> Duration {
        let mut state = self.lock();
        state.prune(now, self.window);
        state.reset_in(now, self.window)
    }

    pub fn remaining(&self) -> usize {
        self.remaining_at(Instant::now())
    }

    pub fn reset_in(&self) -> Duration {
        self.reset_in_at(Instant::now())
    }

    /// Refuse every admission until `until`. An earlier instant never shortens an
    /// existing block.
    pub fn block_until(&self, until: Instant) {
        let mut state = self.lock();
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LogState> {
        // A panic while holding the lock cannot leave the log half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Strategy for SlidingLog {
    #[inline]
    fn process(&self) -> ControlFlow<Reason> {
        self.try_admit_at(Instant::now())
    }
}
