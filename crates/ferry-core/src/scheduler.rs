//! Cancellable timers
//!
//! The save controller never touches a runtime timer API directly; it asks a
//! [`Scheduler`] to run a callback after a delay and keeps the returned
//! [`TimerHandle`] so the timer can be cancelled.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Wrap a scheduler-assigned id
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Scheduler-assigned id
    #[inline]
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Timer service
pub trait Scheduler: Send + Sync {
    /// Run `callback` once after `delay`
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Prevent a timer from firing; no-op if it already fired
    fn cancel(&self, handle: TimerHandle);
}

/// Scheduler backed by `tokio::time`
///
/// Each timer is a spawned task sleeping for its delay. Must be used from
/// within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    inner: Arc<Timers>,
}

#[derive(Debug, Default)]
struct Timers {
    next_id: AtomicU64,
    live: DashMap<u64, Option<tokio::task::AbortHandle>>,
}

impl TokioScheduler {
    /// Create scheduler
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled and not yet fired or cancelled
    #[inline]
    #[must_use]
    pub fn live_timers(&self) -> usize {
        self.inner.live.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.inner);
        // Registered before spawning so a zero delay cannot outrun the insert.
        self.inner.live.insert(id, None);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.live.remove(&id).is_some() {
                callback();
            }
        });

        if let Some(mut entry) = self.inner.live.get_mut(&id) {
            *entry = Some(task.abort_handle());
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some((_, Some(task))) = self.inner.live.remove(&handle.0) {
            task.abort();
        }
    }
}
