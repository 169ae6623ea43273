//! Retry with exponential backoff
//!
//! `backoff(attempt) = 2^attempt * base_delay`, so with the default one
//! second base the first three retries wait 1s, 2s and 4s. A `RateLimit`
//! failure carrying `retry_after` replaces the computed delay for that retry.
//!
//! Which failures are retried is decided by a [`RetryClassifier`] supplied by
//! the caller, not by the policy itself.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Decides whether a failure is worth another attempt
pub trait RetryClassifier: Send + Sync {
    /// Return `true` to schedule another attempt
    fn should_retry(&self, error: &SyncError) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&SyncError) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &SyncError) -> bool {
        self(error)
    }
}

/// Retries transient kinds only (see [`SyncError::is_retryable`])
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl RetryClassifier for TransientOnly {
    fn should_retry(&self, error: &SyncError) -> bool {
        error.is_retryable()
    }
}

/// Retry budget and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied to computed delays
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Create policy with the given budget and base delay
    #[inline]
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: None,
        }
    }

    /// Policy that makes exactly one attempt
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Build a policy from a total attempt budget (first try included)
    #[inline]
    #[must_use]
    pub fn from_attempts(max_attempts: u32, base_delay: Duration) -> Self {
        Self::new(max_attempts.saturating_sub(1), base_delay)
    }

    /// With delay cap
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = Some(cap);
        self
    }

    /// Total attempts this policy allows
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(multiplier);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Delay before retry number `attempt`, honouring `retry_after`
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &SyncError) -> Duration {
        error.retry_after().unwrap_or_else(|| self.backoff(attempt))
    }

    /// Run `op` until it succeeds, the classifier refuses, or the budget runs out
    ///
    /// `op` is called once per attempt with the 0-based attempt number.
    pub async fn run<T, F, Fut, C>(&self, classifier: &C, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        C: RetryClassifier + ?Sized,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(error) => {
                    if attempt >= self.max_retries || !classifier.should_retry(&error) {
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt + 1,
                        };
                    }

                    let delay = self.delay_for(attempt, &error);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        kind = %error.kind(),
                        "attempt failed, retrying: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Result of a retried call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// First success or last failure
    pub result: Result<T, SyncError>,
    /// Attempts made, first try included
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Drop the attempt count
    #[inline]
    pub fn into_result(self) -> Result<T, SyncError> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(31), Duration::from_millis(500));
    }

    #[test]
    fn rate_limit_seeds_delay() {
        let policy = RetryPolicy::default();
        let err = SyncError::rate_limit("slow down", Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(250));

        let err = SyncError::rate_limit("slow down", None);
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let outcome = policy
            .run(&TransientOnly, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::network("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result, Ok(42));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exhausts_with_exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        let start = Instant::now();
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let outcome: RetryOutcome<()> = policy
            .run(&TransientOnly, |_| {
                let stamps = stamps.clone();
                async move {
                    stamps.lock().push(start.elapsed());
                    Err(SyncError::database("unavailable"))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.result, Err(SyncError::database("unavailable")));

        let stamps = stamps.lock().clone();
        let millis: Vec<u128> = stamps.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![0, 1000, 3000, 7000]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_unclassified_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let outcome: RetryOutcome<()> = policy
            .run(&TransientOnly, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::validation("title required"))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closure_classifier() {
        let never = |_: &SyncError| false;
        let outcome: RetryOutcome<()> = RetryPolicy::default()
            .run(&never, |_| async { Err(SyncError::network("down")) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic(base_ms in 1u64..5_000, attempt in 0u32..40) {
            let policy = RetryPolicy::new(64, Duration::from_millis(base_ms));
            prop_assert!(policy.backoff(attempt) <= policy.backoff(attempt + 1));
        }

        #[test]
        fn prop_from_attempts_counts_first_try(attempts in 1u32..100) {
            let policy = RetryPolicy::from_attempts(attempts, Duration::from_millis(1));
            prop_assert_eq!(policy.max_attempts(), attempts);
        }
    }
}
