//! Circuit breaker for one remote dependency
//!
//! # States
//! ```text
//! Closed   --failure_count >= threshold-->  Open
//! Open     --timeout elapsed, next call-->  HalfOpen (one trial call)
//! HalfOpen --trial succeeds-------------->  Closed (failure_count = 0)
//! HalfOpen --trial fails or is dropped-->  Open
//! ```
//!
//! The state is a plain `Copy` struct transformed by pure functions; the
//! [`CircuitBreaker`] wrapper only adds a lock so that admission and commit of
//! a single call are atomic with respect to other callers.

use crate::error::SyncError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Message carried by fast-fail rejections
pub const OPEN_MESSAGE: &str = "circuit breaker open";

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail immediately
    Open,
    /// One trial call allowed
    HalfOpen,
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures that trip the breaker
    pub failure_threshold: u32,
    /// Cooldown measured from the last failure
    pub timeout: Duration,
}

impl BreakerConfig {
    /// Create config
    #[inline]
    #[must_use]
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

/// Outcome of asking the breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, call normally
    Proceed,
    /// Breaker half-open, this call is the trial
    Trial,
    /// Breaker open (or trial already running), do not call
    Reject {
        /// Time left until a trial is allowed
        retry_in: Duration,
    },
}

/// Shared breaker bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Failures since the last success
    pub failure_count: u32,
    /// Current position
    pub state: CircuitState,
    /// When the most recent failure was recorded
    pub last_failure_time: Option<Instant>,
    /// Whether the half-open trial call is still outstanding
    pub trial_in_flight: bool,
}

impl CircuitBreakerState {
    /// Fresh closed breaker
    #[inline]
    #[must_use]
    pub fn closed() -> Self {
        Self {
            failure_count: 0,
            state: CircuitState::Closed,
            last_failure_time: None,
            trial_in_flight: false,
        }
    }

    /// Decide whether a call may go out at `now`
    #[must_use]
    pub fn admit(mut self, now: Instant, config: &BreakerConfig) -> (Self, Admission) {
        match self.state {
            CircuitState::Closed => (self, Admission::Proceed),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map_or(config.timeout, |at| now.saturating_duration_since(at));
                if elapsed < config.timeout {
                    let retry_in = config.timeout - elapsed;
                    (self, Admission::Reject { retry_in })
                } else {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    (self, Admission::Trial)
                }
            }
            CircuitState::HalfOpen if self.trial_in_flight => (
                self,
                Admission::Reject {
                    retry_in: Duration::ZERO,
                },
            ),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                (self, Admission::Trial)
            }
        }
    }

    /// Commit a successful call
    #[must_use]
    pub fn record_success(mut self) -> Self {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.trial_in_flight = false;
        self
    }

    /// Commit a failed call at `now`
    #[must_use]
    pub fn record_failure(mut self, now: Instant, config: &BreakerConfig) -> Self {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        self.trial_in_flight = false;
        if self.failure_count >= config.failure_threshold {
            self.state = CircuitState::Open;
        }
        self
    }
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::closed()
    }
}

/// Breaker guarding every call to one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Create closed breaker for dependency `name`
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::closed()),
        }
    }

    /// Dependency name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thresholds in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Copy of the current bookkeeping
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        *self.state.lock()
    }

    /// Current position
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `op` through the breaker
    ///
    /// # Errors
    /// - `SyncError::Network` with [`OPEN_MESSAGE`] when the breaker rejects
    ///   the call; `op` is not invoked in that case
    /// - whatever `op` returns
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let admission = {
            let mut guard = self.state.lock();
            let (next, admission) = guard.admit(Instant::now(), &self.config);
            *guard = next;
            admission
        };

        match admission {
            Admission::Reject { retry_in } => {
                tracing::debug!(
                    breaker = %self.name,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    "rejecting call"
                );
                return Err(SyncError::network(OPEN_MESSAGE));
            }
            Admission::Trial => {
                tracing::info!(breaker = %self.name, "half-open, sending trial call");
            }
            Admission::Proceed => {}
        }

        let mut trial = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let result = op().await;
        trial.armed = false;

        let mut guard = self.state.lock();
        let before = guard.state;
        let next = match &result {
            Ok(_) => guard.record_success(),
            Err(_) => guard.record_failure(Instant::now(), &self.config),
        };
        *guard = next;

        if before != CircuitState::Open && guard.state == CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                failures = guard.failure_count,
                "circuit opened"
            );
        } else if before == CircuitState::HalfOpen && guard.state == CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }

        result
    }
}

/// Counts a half-open trial that is dropped before it settles as failed
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = self.breaker.state.lock();
        *guard = guard.record_failure(Instant::now(), &self.breaker.config);
        tracing::warn!(breaker = %self.breaker.name, "trial call abandoned, circuit reopened");
    }
}
