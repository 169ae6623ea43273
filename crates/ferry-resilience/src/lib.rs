//! Ferry Resilience
//!
//! Building blocks for calling an unreliable remote dependency:
//! - [`SyncError`]: closed taxonomy of failure kinds with structured fields
//! - [`RetryPolicy`]: bounded retries with exponential backoff
//! - [`CircuitBreaker`]: fail fast against a dependency that keeps failing
//! - [`with_timeout`]: hard ceiling on how long a single call is awaited
//!
//! Each primitive wraps an arbitrary fallible async call and returns the same
//! `Result<T, SyncError>` shape, so they stack:
//!
//! ```rust,ignore
//! use ferry_resilience::{with_timeout, CircuitBreaker, RetryPolicy, TransientOnly};
//!
//! let outcome = policy
//!     .run(&TransientOnly, |_| breaker.call(|| with_timeout(limit, store.save(&doc))))
//!     .await;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod circuit_breaker;
mod error;
mod retry;
mod timeout;

pub use circuit_breaker::{
    Admission, BreakerConfig, CircuitBreaker, CircuitBreakerState, CircuitState, OPEN_MESSAGE,
};
pub use error::{ErrorKind, SyncError};
pub use retry::{RetryClassifier, RetryOutcome, RetryPolicy, TransientOnly};
pub use timeout::{timeout_message, with_timeout};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
