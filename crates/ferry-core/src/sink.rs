//! Terminal failure reporting
//!
//! When a save chain gives up, the controller hands a [`TerminalFailure`] to
//! the host's [`FailureSink`]. The failure carries a [`RetryHandle`] so a
//! "retry" action in the notification can restart the chain.

use crate::save_controller::SaveCommand;
use crate::types::ResourceId;
use ferry_resilience::SyncError;
use tokio::sync::mpsc;

/// Receives failures the user must be told about
pub trait FailureSink: Send + Sync {
    /// Called once per exhausted or fatal save chain
    fn terminal_failure(&self, failure: TerminalFailure);
}

/// A save chain that will not retry on its own
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    /// Resource whose save failed
    pub resource_id: ResourceId,
    /// Last error of the chain
    pub error: SyncError,
    /// Restarts the chain
    pub retry: RetryHandle,
}

/// Restarts a failed save chain from the notification
#[derive(Debug, Clone)]
pub struct RetryHandle {
    mailbox: mpsc::WeakUnboundedSender<SaveCommand>,
}

impl RetryHandle {
    pub(crate) fn new(mailbox: mpsc::WeakUnboundedSender<SaveCommand>) -> Self {
        Self { mailbox }
    }

    /// Request a manual retry
    ///
    /// Returns `false` if the controller has already shut down.
    pub fn retry(&self) -> bool {
        self.mailbox
            .upgrade()
            .is_some_and(|tx| tx.send(SaveCommand::ManualRetry).is_ok())
    }
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn terminal_failure(&self, failure: TerminalFailure) {
        tracing::error!(
            resource = %failure.resource_id,
            kind = %failure.error.kind(),
            "save failed: {}",
            failure.error
        );
    }
}
