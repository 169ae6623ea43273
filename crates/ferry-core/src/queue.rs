//! Operation queue for discrete entities
//!
//! Optimistic local mutations (create, update, delete, reorder) are appended
//! here after they have been applied to the UI. [`OperationQueue::drain`]
//! replays them against the remote mutation set:
//! - operations on the same entity run in enqueue order
//! - different entities run concurrently
//! - each operation has its own retry budget; one failing never blocks the
//!   others
//! - an operation that exhausts its budget moves to the dead set and is
//!   reported, never dropped
//! - if a drain is cancelled, operations it had not settled go back to the
//!   front of the pending buffer

use crate::config::QueueConfig;
use crate::remote::RemoteMutations;
use crate::types::{Ack, EntityId, OperationId};
use chrono::{DateTime, Utc};
use ferry_resilience::{CircuitBreaker, RetryPolicy, SyncError, TransientOnly};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new entity
    Create,
    /// Change fields of an entity
    Update,
    /// Remove an entity
    Delete,
    /// Move an entity; sent as an update of its position and status
    Reorder,
}

impl OperationKind {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Reorder => "reorder",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffered local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique ID
    pub id: OperationId,
    /// What to do
    pub kind: OperationKind,
    /// Target entity
    pub entity: EntityId,
    /// Data sent with the mutation
    pub payload: Value,
    /// Retries spent in the last drain
    pub retry_count: u32,
    /// When the local edit happened
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Create operation
    pub fn new(kind: OperationKind, entity: impl Into<EntityId>, payload: Value) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            entity: entity.into(),
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Create `entity` from `payload`
    pub fn create(entity: impl Into<EntityId>, payload: Value) -> Self {
        Self::new(OperationKind::Create, entity, payload)
    }

    /// Update `entity` with `payload`
    pub fn update(entity: impl Into<EntityId>, payload: Value) -> Self {
        Self::new(OperationKind::Update, entity, payload)
    }

    /// Delete `entity`
    pub fn delete(entity: impl Into<EntityId>) -> Self {
        Self::new(OperationKind::Delete, entity, Value::Null)
    }

    /// Move `entity` to `position` within `status`
    pub fn reorder(entity: impl Into<EntityId>, position: u32, status: impl Into<String>) -> Self {
        let payload = json!({ "position": position, "status": status.into() });
        Self::new(OperationKind::Reorder, entity, payload)
    }
}

/// An operation that exhausted its retry budget
#[derive(Debug, Clone, PartialEq)]
pub struct DeadOperation {
    /// The operation, with its final retry count
    pub operation: Operation,
    /// Last failure
    pub error: SyncError,
}

/// Aggregate result of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations acknowledged
    pub successful: usize,
    /// Operations moved to the dead set
    pub failed: usize,
    /// IDs of the operations that failed
    pub dead: Vec<OperationId>,
}

impl DrainReport {
    /// Operations processed
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Buffer of mutations for one kind of entity
pub struct OperationQueue {
    entity_kind: String,
    remote: Arc<dyn RemoteMutations>,
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    pending: Mutex<VecDeque<Operation>>,
    in_flight: Mutex<Vec<Operation>>,
    dead: Mutex<Vec<DeadOperation>>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl OperationQueue {
    /// Create queue for `entity_kind` (e.g. "card")
    pub fn new(entity_kind: impl Into<String>, remote: Arc<dyn RemoteMutations>, config: &QueueConfig) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            remote,
            policy: config.retry_policy(),
            breaker: None,
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            dead: Mutex::new(Vec::new()),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Route every call through `breaker`
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Entity kind served
    #[inline]
    #[must_use]
    pub fn entity_kind(&self) -> &str {
        &self.entity_kind
    }

    /// Append an operation
    pub fn enqueue(&self, operation: Operation) -> OperationId {
        let id = operation.id;
        tracing::debug!(
            entity_kind = %self.entity_kind,
            operation = %id,
            kind = %operation.kind,
            entity = %operation.entity,
            "operation enqueued"
        );
        self.pending.lock().push_back(operation);
        id
    }

    /// Append a create
    pub fn enqueue_create(&self, entity: impl Into<EntityId>, payload: Value) -> OperationId {
        self.enqueue(Operation::create(entity, payload))
    }

    /// Append an update
    pub fn enqueue_update(&self, entity: impl Into<EntityId>, payload: Value) -> OperationId {
        self.enqueue(Operation::update(entity, payload))
    }

    /// Append a delete
    pub fn enqueue_delete(&self, entity: impl Into<EntityId>) -> OperationId {
        self.enqueue(Operation::delete(entity))
    }

    /// Append a reorder
    pub fn enqueue_reorder(
        &self,
        entity: impl Into<EntityId>,
        position: u32,
        status: impl Into<String>,
    ) -> OperationId {
        self.enqueue(Operation::reorder(entity, position, status))
    }

    /// Operations waiting for the next drain
    #[must_use]
    pub fn pending(&self) -> Vec<Operation> {
        self.pending.lock().iter().cloned().collect()
    }

    /// Number of operations waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Operations that exhausted their budget, oldest first
    #[must_use]
    pub fn dead(&self) -> Vec<DeadOperation> {
        self.dead.lock().clone()
    }

    /// Move a dead operation back to pending with a fresh budget
    ///
    /// Returns `false` if `id` is not in the dead set.
    pub fn revive(&self, id: OperationId) -> bool {
        let revived = {
            let mut dead = self.dead.lock();
            let Some(index) = dead.iter().position(|d| d.operation.id == id) else {
                return false;
            };
            dead.remove(index)
        };

        let mut operation = revived.operation;
        operation.retry_count = 0;
        tracing::info!(entity_kind = %self.entity_kind, operation = %id, "dead operation revived");
        self.pending.lock().push_back(operation);
        true
    }

    /// Replay every pending operation
    ///
    /// Concurrent drains are serialized; operations enqueued while a drain
    /// runs wait for the next one. Each operation is committed as it settles,
    /// so dropping the returned future loses nothing: unsettled operations are
    /// put back in front of the pending buffer. An operation whose request
    /// was already sent may then be sent again by the next drain.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let batch: Vec<Operation> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return DrainReport::default();
        }
        self.in_flight.lock().extend(batch.iter().cloned());
        let _restore = RestoreUnsettled { queue: self };

        let groups = group_by_entity(batch);
        let settled = join_all(groups.into_iter().map(|ops| self.drain_entity(ops))).await;

        let mut report = DrainReport::default();
        for outcome in settled.into_iter().flatten() {
            match outcome {
                Ok(()) => report.successful += 1,
                Err(id) => {
                    report.failed += 1;
                    report.dead.push(id);
                }
            }
        }

        tracing::info!(
            entity_kind = %self.entity_kind,
            successful = report.successful,
            failed = report.failed,
            "queue drained"
        );
        report
    }

    async fn drain_entity(&self, operations: Vec<Operation>) -> Vec<Result<(), OperationId>> {
        let mut settled = Vec::with_capacity(operations.len());
        for mut operation in operations {
            let outcome = {
                let op = &operation;
                self.policy.run(&TransientOnly, move |_| self.dispatch(op)).await
            };
            operation.retry_count = outcome.attempts.saturating_sub(1);
            let label = format!("{} {}", operation.kind, self.entity_kind);
            let result = outcome.result.map_err(|e| e.into_database(&label));
            settled.push(self.settle(operation, result));
        }
        settled
    }

    /// Commit one finished operation
    fn settle(&self, operation: Operation, result: Result<Ack, SyncError>) -> Result<(), OperationId> {
        let id = operation.id;
        self.in_flight.lock().retain(|o| o.id != id);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::error!(
                    entity_kind = %self.entity_kind,
                    operation = %id,
                    kind = %operation.kind,
                    entity = %operation.entity,
                    retries = operation.retry_count,
                    "operation failed: {}",
                    error
                );
                self.dead.lock().push(DeadOperation { operation, error });
                Err(id)
            }
        }
    }

    async fn dispatch(&self, operation: &Operation) -> Result<Ack, SyncError> {
        match &self.breaker {
            Some(breaker) => breaker.call(|| self.send(operation)).await,
            None => self.send(operation).await,
        }
    }

    async fn send(&self, operation: &Operation) -> Result<Ack, SyncError> {
        match operation.kind {
            OperationKind::Create => self.remote.create(&operation.entity, &operation.payload).await,
            OperationKind::Update | OperationKind::Reorder => {
                self.remote.update(&operation.entity, &operation.payload).await
            }
            OperationKind::Delete => self.remote.delete(&operation.entity).await,
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("entity_kind", &self.entity_kind)
            .field("policy", &self.policy)
            .field("pending", &self.pending.lock().len())
            .field("dead", &self.dead.lock().len())
            .finish_non_exhaustive()
    }
}

/// Returns a cancelled drain's unsettled operations to pending
struct RestoreUnsettled<'a> {
    queue: &'a OperationQueue,
}

impl Drop for RestoreUnsettled<'_> {
    fn drop(&mut self) {
        let unsettled: Vec<Operation> = self.queue.in_flight.lock().drain(..).collect();
        if unsettled.is_empty() {
            return;
        }
        tracing::warn!(
            entity_kind = %self.queue.entity_kind,
            operations = unsettled.len(),
            "drain cancelled, returning unsettled operations to pending"
        );
        let mut pending = self.queue.pending.lock();
        for operation in unsettled.into_iter().rev() {
            pending.push_front(operation);
        }
    }
}

/// Split a batch into per-entity runs, keeping first-seen entity order
fn group_by_entity(batch: Vec<Operation>) -> Vec<Vec<Operation>> {
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    let mut groups: Vec<Vec<Operation>> = Vec::new();
    for operation in batch {
        match index.get(&operation.entity) {
            Some(&slot) => groups[slot].push(operation),
            None => {
                index.insert(operation.entity.clone(), groups.len());
                groups.push(vec![operation]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteMutations;
    use ferry_resilience::{BreakerConfig, ErrorKind};
    use std::time::Duration;

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    #[test]
    fn reorder_is_position_update() {
        let op = Operation::reorder("card-1", 4, "done");
        assert_eq!(op.kind, OperationKind::Reorder);
        assert_eq!(op.payload, json!({ "position": 4, "status": "done" }));
    }

    #[test]
    fn groups_keep_entity_order() {
        let batch = vec![
            Operation::update("a", json!(1)),
            Operation::update("b", json!(1)),
            Operation::update("a", json!(2)),
        ];
        let groups = group_by_entity(batch);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0][1].payload, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_delete_does_not_block_others() {
        let mut remote = MockRemoteMutations::new();
        remote.expect_create().times(1).returning(|_, _| Ok(Ack::new()));
        remote.expect_update().times(1).returning(|_, _| Ok(Ack::new()));
        remote
            .expect_delete()
            .times(3)
            .returning(|_| Err(SyncError::network("connection reset")));

        let queue = OperationQueue::new("card", Arc::new(remote), &config());
        queue.enqueue_create("A", json!({ "title": "a" }));
        queue.enqueue_update("B", json!({ "title": "b" }));
        let c = queue.enqueue_delete("C");

        let report = queue.drain().await;
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead, vec![c]);
        assert!(queue.is_empty());

        let dead = queue.dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].operation.id, c);
        assert_eq!(dead[0].operation.retry_count, 2);
        assert_eq!(dead[0].error.kind(), ErrorKind::Database);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_is_not_retried() {
        let mut remote = MockRemoteMutations::new();
        remote
            .expect_create()
            .times(1)
            .returning(|_, _| Err(SyncError::validation("title required").with_field("title")));

        let queue = OperationQueue::new("card", Arc::new(remote), &config());
        queue.enqueue_create("A", json!({}));

        let report = queue.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(queue.dead()[0].operation.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reorder_dispatches_update() {
        let mut remote = MockRemoteMutations::new();
        remote
            .expect_update()
            .withf(|entity, payload| entity.as_str() == "card-9" && payload["position"] == 2)
            .times(1)
            .returning(|_, _| Ok(Ack::new()));

        let queue = OperationQueue::new("card", Arc::new(remote), &config());
        queue.enqueue_reorder("card-9", 2, "in_progress");
        assert_eq!(queue.drain().await.successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn revive_moves_dead_back_to_pending() {
        let mut remote = MockRemoteMutations::new();
        let mut calls = 0;
        remote.expect_delete().times(4).returning(move |_| {
            calls += 1;
            if calls <= 3 {
                Err(SyncError::database("locked"))
            } else {
                Ok(Ack::new())
            }
        });

        let queue = OperationQueue::new("card", Arc::new(remote), &config());
        let id = queue.enqueue_delete("C");
        assert_eq!(queue.drain().await.failed, 1);

        assert!(queue.revive(id));
        assert!(!queue.revive(id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].retry_count, 0);

        let report = queue.drain().await;
        assert_eq!(report.successful, 1);
        assert!(queue.dead().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_dispatch_once() {
        let mut remote = MockRemoteMutations::new();
        remote.expect_create().times(1).returning(|_, _| Ok(Ack::new()));

        let queue = OperationQueue::new("card", Arc::new(remote), &config());
        queue.enqueue_create("A", json!({}));

        let (first, second) = tokio::join!(queue.drain(), queue.drain());
        assert_eq!(first.total() + second.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast() {
        let mut remote = MockRemoteMutations::new();
        remote
            .expect_update()
            .times(1)
            .returning(|_, _| Err(SyncError::external("kanban-api", "503")));

        let breaker = Arc::new(CircuitBreaker::new(
            "kanban-api",
            BreakerConfig::new(1, Duration::from_secs(60)),
        ));
        let queue = OperationQueue::new("card", Arc::new(remote), &config()).with_breaker(breaker);
        queue.enqueue_update("A", json!({}));

        let report = queue.drain().await;
        assert_eq!(report.failed, 1);
        let dead = queue.dead();
        assert!(dead[0].error.to_string().contains("circuit breaker open"));
    }
}
