//! Timeout race
//!
//! Races a call against a delayed failure. The delay is a `tokio` timer owned
//! by the returned future, so it is dropped as soon as the call settles.
//! On timeout the call's future is dropped: we stop waiting for it, and any
//! result it would have produced is never observed.

use crate::error::SyncError;
use std::future::Future;
use std::time::Duration;

/// Message produced for a timeout of `limit`
#[must_use]
pub fn timeout_message(limit: Duration) -> String {
    format!("timed out after {}ms", limit.as_millis())
}

/// Await `op`, failing with `SyncError::Network` once `limit` elapses
///
/// # Errors
/// - `SyncError::Network { message: "timed out after <ms>ms" }` on timeout
/// - whatever `op` returns
pub async fn with_timeout<T, Fut>(limit: Duration, op: Fut) -> Result<T, SyncError>
where
    Fut: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(
                limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "call timed out"
            );
            Err(SyncError::network(timeout_message(limit)))
        }
    }
}
