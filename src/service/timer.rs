//! Timed waits resolved by the external tick.
//!
//! Callers register a deadline and await it; the driving loop calls
//! [`TimerService::update`] once per cycle, which drains the deferred-event
//! index and resolves every due wait with `true`. A wait canceled through its
//! [`CancellationToken`] is removed from the index before expiry and yields
//! `false`; a canceled timer id never fires on a later tick.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::completion::{completion, Awaitable, Completion};
use crate::core::deferred::DeferredIndex;
use crate::utils::time::now_ms;

pub struct TimerService {
    inner: Mutex<TimerInner>,
}

struct TimerInner {
    /// timer id -> completion handle to resolve on expiry.
    timers: HashMap<u64, Completion<bool>>,
    /// deadline -> timer ids.
    index: DeferredIndex<u64>,
    next_id: u64,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                timers: HashMap::new(),
                index: DeferredIndex::new(),
                next_id: 1,
            }),
        }
    }

    /// Number of pending waits.
    pub fn pending(&self) -> usize {
        self.inner.lock().map(|inner| inner.timers.len()).unwrap_or(0)
    }

    /// One external driving cycle: resolve every wait whose deadline has
    /// passed. Waits registered mid-drain keep their own deadlines.
    pub fn update(&self) {
        let due = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.index.is_empty() {
                return;
            }
            let now = now_ms();
            let ids = inner.index.drain(now);
            ids.into_iter()
                .filter_map(|id| inner.timers.remove(&id))
                .collect::<Vec<_>>()
        };
        for mut timer in due {
            timer.resolve(true);
        }
    }

    /// Wait roughly `delay_ms` milliseconds, resolved by the driving tick.
    /// Yields `true` once the deadline passes.
    pub async fn wait(&self, delay_ms: u64) -> bool {
        self.wait_until(now_ms() + delay_ms).await
    }

    /// Wait until the absolute deadline `deadline_ms` (wall-clock ms).
    pub async fn wait_until(&self, deadline_ms: u64) -> bool {
        let (_, awaitable) = self.register(deadline_ms);
        awaitable.wait().await.unwrap_or(false)
    }

    /// Like [`wait`](Self::wait), but abortable: cancellation removes the
    /// entry before expiry and the call yields `false`.
    pub async fn wait_cancelable(&self, delay_ms: u64, token: &CancellationToken) -> bool {
        self.wait_until_cancelable(now_ms() + delay_ms, token).await
    }

    /// Like [`wait_until`](Self::wait_until), but abortable.
    pub async fn wait_until_cancelable(
        &self,
        deadline_ms: u64,
        token: &CancellationToken,
    ) -> bool {
        let (id, awaitable) = self.register(deadline_ms);
        tokio::select! {
            _ = token.cancelled() => {
                self.remove(id);
                false
            }
            fired = awaitable.wait() => fired.unwrap_or(false),
        }
    }

    fn register(&self, deadline_ms: u64) -> (u64, Awaitable<bool>) {
        let (handle, awaitable) = completion();
        let Ok(mut inner) = self.inner.lock() else {
            // Poisoned state: the awaitable resolves None -> false.
            return (0, awaitable);
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.timers.insert(id, handle);
        inner.index.add(deadline_ms, id);
        trace!(id, deadline_ms, "timer registered");
        (id, awaitable)
    }

    /// Cancel before expiry. The completion handle is canceled so the
    /// awaiting side observes the abort instead of hanging.
    fn remove(&self, id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.index.remove(&id);
        if let Some(mut timer) = inner.timers.remove(&id) {
            timer.cancel();
        }
    }
}
