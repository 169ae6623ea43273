//! Seams to the outside world
//!
//! The engine never talks to a transport or a UI directly. Hosts implement
//! these traits for their backend and editor.

use crate::types::{Ack, EntityId, ResourceId};
use ferry_resilience::SyncError;
use serde_json::Value;

/// Remote persistence for whole-resource snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist the full serialized state of `resource`
    async fn save(&self, resource: &ResourceId, body: &Value) -> Result<Ack, SyncError>;
}

/// Remote mutations for discrete entities
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RemoteMutations: Send + Sync {
    /// Create `entity` from `payload`
    async fn create(&self, entity: &EntityId, payload: &Value) -> Result<Ack, SyncError>;

    /// Apply `payload` to an existing entity
    async fn update(&self, entity: &EntityId, payload: &Value) -> Result<Ack, SyncError>;

    /// Remove `entity`
    async fn delete(&self, entity: &EntityId) -> Result<Ack, SyncError>;
}

/// Produces the current local state of the edited resource
///
/// Called on the controller task whenever a save needs a snapshot, so it must
/// be cheap and must not block.
pub trait SnapshotSource: Send + Sync {
    /// Serialize current state
    fn snapshot(&self) -> Value;
}

impl<F> SnapshotSource for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn snapshot(&self) -> Value {
        self()
    }
}

/// Local view receiving authoritative remote state
pub trait LocalView: Send + Sync {
    /// Replace local state with `body`
    fn apply_remote(&self, body: &Value);
}
