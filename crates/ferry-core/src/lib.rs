//! Ferry Core - optimistic synchronization engine
//!
//! Keeps locally mutated state in step with an authoritative remote store
//! over an unreliable link:
//! - Debounced, fingerprint-deduplicated saves of continuously edited resources
//! - At most one write in flight per resource, bounded retries with backoff
//! - A replay queue for discrete entity mutations that never loses an entry
//! - Reconciliation of inbound remote snapshots without clobbering local work
//!
//! # Example
//!
//! ```rust,ignore
//! use ferry_core::prelude::*;
//!
//! # async fn example(store: Arc<dyn DocumentStore>, canvas: Arc<dyn SnapshotSource>) -> Result<(), SyncError> {
//! let config = EngineConfig::new();
//! let breaker = Arc::new(CircuitBreaker::new("documents", config.breaker.breaker_config()));
//! let mut session = EditorSession::new(SaveEnvironment::new(store, breaker, &config.save));
//!
//! let handle = session.open(ResourceId::new("canvas-42"), canvas)?;
//! handle.notify_edit();
//! handle.blur();
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

// Core modules
pub mod config;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod save_controller;
pub mod save_state;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod types;

// Re-exports for convenience
pub use config::{BreakerSettings, ConfigError, EngineConfig, QueueConfig, SaveConfig};
pub use queue::{DeadOperation, DrainReport, Operation, OperationKind, OperationQueue};
pub use reconcile::{ReconcileDecision, ReconcileStats, Reconciler};
pub use remote::{DocumentStore, LocalView, RemoteMutations, SnapshotSource};
pub use save_controller::{SaveEnvironment, SaveHandle};
pub use save_state::{
    transition, FlushTrigger, SaveEffect, SaveEvent, SavePolicy, SaveState, SaveStatus,
};
pub use scheduler::{Scheduler, TimerCallback, TimerHandle, TokioScheduler};
pub use session::EditorSession;
pub use sink::{FailureSink, RetryHandle, TerminalFailure, TracingSink};
pub use types::{Ack, EntityId, Fingerprint, OperationId, ResourceId, Snapshot};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring the engine into a host
    pub use crate::{
        Ack, DocumentStore, EditorSession, EngineConfig, EntityId, FailureSink, FlushTrigger,
        LocalView, OperationQueue, Reconciler, RemoteMutations, ResourceId, SaveEnvironment,
        SaveHandle, SaveStatus, SnapshotSource,
    };
    pub use ferry_resilience::{CircuitBreaker, ErrorKind, SyncError};
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
