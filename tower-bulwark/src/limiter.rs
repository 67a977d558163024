use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use bulwark::Backoff;
use bulwark::KeyedWindows;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower::BoxError;
use tracing::debug;
use tracing::warn;

use crate::error::BulwarkError;
use crate::events::Events;
use crate::events::RateLimitCause;
use crate::events::RateLimitEvent;
use crate::request::ApiResponse;
use crate::request::CallTrace;

/// Shortest pause between two drain checks of the same key.
const MIN_DRAIN_WAIT: Duration = Duration::from_millis(1);

type Invoke = Box<dyn FnMut() -> BoxFuture<'static, Result<ApiResponse, BoxError>> + Send>;

/// A deferred execution the limiter can run, and rerun after a server 429.
pub struct Call {
    invoke: Invoke,
    trace: CallTrace,
}

impl Call {
    pub fn new<F>(trace: CallTrace, invoke: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, Result<ApiResponse, BoxError>> + Send + 'static,
    {
        Self {
            invoke: Box::new(invoke),
            trace,
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").field("trace", &self.trace).finish()
    }
}

struct QueueEntry {
    call: Call,
    requeues: u32,
    /// Set after a server 429; the entry is not run before this instant.
    not_before: Option<Instant>,
    continuation: oneshot::Sender<Result<ApiResponse, BoxError>>,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    /// Keys with a live drain task.
    draining: HashSet<String>,
}

enum Step {
    Idle,
    Wait(Duration),
    Run(QueueEntry),
}

enum Admission {
    Run(QueueEntry),
    Queued { depth: usize, retry_after: Duration },
    Refused(BulwarkError),
}

/// Sliding-window admission with a FIFO queue per key.
///
/// Calls the windows admit run at once; the rest wait in their key's queue and a
/// drain task admits them in order as the window frees up. A call the server
/// answers with 429 goes back to the head of its queue until the server's hint
/// has elapsed, up to `max_requeues` times.
pub struct RateLimiter {
    windows: KeyedWindows,
    state: Mutex<QueueState>,
    max_requeues: u32,
    requeue_backoff: Backoff,
    queue_capacity: Option<NonZeroUsize>,
    fail_fast: bool,
    events: Events,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("windows", &self.windows)
            .field("max_requeues", &self.max_requeues)
            .field("queue_capacity", &self.queue_capacity)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(windows: KeyedWindows) -> Self {
        Self {
            windows,
            state: Mutex::new(QueueState::default()),
            max_requeues: 3,
            requeue_backoff: Backoff::default(),
            queue_capacity: None,
            fail_fast: false,
            events: Events::default(),
        }
    }

    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = max_requeues;
        self
    }

    /// Delay used after a 429 that carried no `Retry-After`.
    pub fn with_requeue_backoff(mut self, backoff: Backoff) -> Self {
        self.requeue_backoff = backoff;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Refuse calls the window denies instead of queueing them.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn windows(&self) -> &KeyedWindows {
        &self.windows
    }

    pub fn resolve_key(&self, path: &str, explicit: Option<&str>) -> String {
        self.windows.resolve_key(path, explicit)
    }

    pub fn remaining(&self, key: &str) -> usize {
        self.windows.remaining(key)
    }

    pub fn reset_in(&self, key: &str) -> Duration {
        self.windows.reset_in(key)
    }

    /// Calls waiting in `key`'s queue.
    pub fn queued(&self, key: &str) -> usize {
        self.lock().queues.get(key).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `call` once `key`'s windows admit it, in arrival order.
    ///
    /// Dropping the returned future abandons the call: a queued entry is skipped
    /// by the drain, and a running one is dropped.
    pub async fn admit_or_queue(
        self: &Arc<Self>,
        key: String,
        call: Call,
    ) -> Result<ApiResponse, BoxError> {
        let (continuation, outcome) = oneshot::channel();
        let entry = QueueEntry {
            call,
            requeues: 0,
            not_before: None,
            continuation,
        };

        match self.admit(&key, entry) {
            Admission::Run(entry) => {
                debug!(%key, "admitted");
                tokio::spawn(Arc::clone(self).execute(key, entry));
            }
            Admission::Queued { depth, retry_after } => {
                debug!(%key, depth, retry_after_ms = retry_after.as_millis() as u64, "queued");
                self.events.rate_limited(&RateLimitEvent {
                    key: &key,
                    requeues: 0,
                    retry_after,
                    cause: RateLimitCause::Window,
                });
            }
            Admission::Refused(err) => {
                debug!(%key, error = %err, "refused");
                return Err(Box::new(err));
            }
        }

        match outcome.await {
            Ok(result) => result,
            // The executing task went away without answering; only a runtime
            // shutdown does that.
            Err(_) => Err(Box::new(BulwarkError::Inner(
                "rate limiter dropped the call".to_string(),
            ))),
        }
    }

    fn admit(self: &Arc<Self>, key: &str, entry: QueueEntry) -> Admission {
        let mut state = self.lock();
        let depth = state.queues.get(key).map_or(0, VecDeque::len);

        // A new call never jumps a non-empty queue.
        let retry_after = if depth == 0 {
            match self.windows.try_admit(key) {
                ControlFlow::Continue(()) => return Admission::Run(entry),
                ControlFlow::Break(reason) => reason.retry_after(),
            }
        } else {
            self.windows.reset_in(key)
        };

        if self.fail_fast {
            return Admission::Refused(BulwarkError::RateLimited {
                retry_after,
                requeues: 0,
            });
        }
        if let Some(capacity) = self.queue_capacity
            && depth >= capacity.get()
        {
            return Admission::Refused(BulwarkError::Overloaded);
        }

        state
            .queues
            .entry(key.to_string())
            .or_default()
            .push_back(entry);
        self.ensure_draining(&mut state, key);
        Admission::Queued {
            depth: depth + 1,
            retry_after,
        }
    }

    fn ensure_draining(self: &Arc<Self>, state: &mut QueueState, key: &str) {
        if state.draining.insert(key.to_string()) {
            tokio::spawn(Arc::clone(self).drain(key.to_string()));
        }
    }

    fn next_step(&self, state: &mut QueueState, key: &str) -> Step {
        let Some(queue) = state.queues.get_mut(key) else {
            return Step::Idle;
        };
        while let Some(head) = queue.front()
            && head.continuation.is_closed()
        {
            debug!(%key, "discarding abandoned call");
            queue.pop_front();
        }

        let now = Instant::now();
        let Some(head) = queue.front() else {
            return Step::Idle;
        };
        if let Some(not_before) = head.not_before
            && not_before > now
        {
            return Step::Wait(not_before - now);
        }
        match self.windows.try_admit_at(key, now) {
            ControlFlow::Continue(()) => match queue.pop_front() {
                Some(entry) => Step::Run(entry),
                None => Step::Idle,
            },
            ControlFlow::Break(reason) => Step::Wait(reason.retry_after()),
        }
    }

    async fn drain(self: Arc<Self>, key: String) {
        loop {
            let step = {
                let mut state = self.lock();
                let step = self.next_step(&mut state, &key);
                if let Step::Idle = step {
                    state.queues.remove(&key);
                    state.draining.remove(&key);
                }
                step
            };

            match step {
                Step::Idle => return,
                Step::Run(entry) => {
                    debug!(%key, requeues = entry.requeues, "admitted from queue");
                    tokio::spawn(Arc::clone(&self).execute(key.clone(), entry));
                }
                Step::Wait(wait) => tokio::time::sleep(wait.max(MIN_DRAIN_WAIT)).await,
            }
        }
    }

    async fn execute(self: Arc<Self>, key: String, mut entry: QueueEntry) {
        let result = tokio::select! {
            biased;
            _ = entry.continuation.closed() => {
                debug!(%key, "caller went away; dropping call");
                return;
            }
            result = (entry.call.invoke)() => result,
        };

        let hint = match &result {
            Err(err) => BulwarkError::peek(err)
                .filter(|failure| failure.is_server_rate_limit())
                .map(|failure| {
                    failure
                        .retry_after()
                        .unwrap_or_else(|| self.requeue_backoff.delay(entry.requeues + 1))
                }),
            Ok(_) => None,
        };
        let Some(retry_after) = hint else {
            let _ = entry.continuation.send(result);
            return;
        };

        // A hint past the end of the clock can never be waited out.
        let until = Instant::now().checked_add(retry_after);
        let Some(until) = until.filter(|_| entry.requeues < self.max_requeues) else {
            warn!(
                %key,
                requeues = entry.requeues,
                retry_after_ms = retry_after.as_millis() as u64,
                "server kept rate limiting; giving up"
            );
            let _ = entry.continuation.send(Err(Box::new(BulwarkError::RateLimited {
                retry_after,
                requeues: entry.requeues,
            })));
            return;
        };

        entry.requeues += 1;
        entry.call.trace.record_requeue();
        entry.not_before = Some(until);
        self.windows.block_until(&key, until);
        let requeues = entry.requeues;
        warn!(
            %key,
            requeues,
            retry_after_ms = retry_after.as_millis() as u64,
            "server rate limited; requeueing"
        );

        {
            let mut state = self.lock();
            state
                .queues
                .entry(key.clone())
                .or_default()
                .push_front(entry);
            self.ensure_draining(&mut state, &key);
        }
        self.events.rate_limited(&RateLimitEvent {
            key: &key,
            requeues,
            retry_after,
            cause: RateLimitCause::Server,
        });
    }
}
