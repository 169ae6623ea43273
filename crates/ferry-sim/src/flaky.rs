//! In-process backends that fail at random

use ferry_core::{Ack, DocumentStore, EntityId, RemoteMutations, ResourceId, SnapshotSource};
use ferry_resilience::SyncError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Seeded failure and latency source
pub(crate) struct Flaky {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    max_latency_ms: u64,
}

impl Flaky {
    pub(crate) fn new(seed: u64, failure_rate: f64, max_latency: Duration) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            max_latency_ms: u64::try_from(max_latency.as_millis()).unwrap_or(u64::MAX).max(1),
        }
    }

    fn roll(&self, target: &str) -> (Duration, Option<SyncError>) {
        let mut rng = self.rng.lock();
        let latency = Duration::from_millis(rng.gen_range(1..=self.max_latency_ms));
        if !rng.gen_bool(self.failure_rate) {
            return (latency, None);
        }
        let error = match rng.gen_range(0..4) {
            0 => SyncError::network("connection reset").with_url(target),
            1 => SyncError::database("write conflict"),
            2 => SyncError::rate_limit("too many requests", Some(Duration::from_millis(1500))),
            _ => SyncError::external("backend", "bad gateway").with_status(502),
        };
        (latency, Some(error))
    }

    async fn call(&self, target: &str) -> Result<(), SyncError> {
        let (latency, failure) = self.roll(target);
        tokio::time::sleep(latency).await;
        failure.map_or(Ok(()), Err)
    }
}

/// Document store failing at random
pub(crate) struct FlakyStore {
    flaky: Flaky,
    calls: AtomicU64,
}

impl FlakyStore {
    pub(crate) fn new(flaky: Flaky) -> Self {
        Self {
            flaky,
            calls: AtomicU64::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl DocumentStore for FlakyStore {
    async fn save(&self, resource: &ResourceId, _body: &Value) -> Result<Ack, SyncError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.flaky.call(&format!("/documents/{resource}")).await?;
        Ok(Ack::with_revision(format!("r{n}")))
    }
}

/// Remote mutation set failing at random
pub(crate) struct FlakyMutations {
    flaky: Flaky,
    calls: AtomicU64,
}

impl FlakyMutations {
    pub(crate) fn new(flaky: Flaky) -> Self {
        Self {
            flaky,
            calls: AtomicU64::new(0),
        }
    }

    pub(crate) fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn answer(&self, entity: &EntityId) -> Result<Ack, SyncError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.flaky.call(&format!("/cards/{entity}")).await?;
        Ok(Ack::new())
    }
}

#[async_trait::async_trait]
impl RemoteMutations for FlakyMutations {
    async fn create(&self, entity: &EntityId, _payload: &Value) -> Result<Ack, SyncError> {
        self.answer(entity).await
    }

    async fn update(&self, entity: &EntityId, _payload: &Value) -> Result<Ack, SyncError> {
        self.answer(entity).await
    }

    async fn delete(&self, entity: &EntityId) -> Result<Ack, SyncError> {
        self.answer(entity).await
    }
}

/// Canvas whose state is a growing list of shapes
#[derive(Default)]
pub(crate) struct Canvas {
    shapes: Mutex<Vec<Value>>,
}

impl Canvas {
    pub(crate) fn draw(&self, n: u32) {
        self.shapes
            .lock()
            .push(json!({ "kind": "rect", "x": n * 10, "y": n * 5 }));
    }
}

impl SnapshotSource for Canvas {
    fn snapshot(&self) -> Value {
        json!({ "shapes": *self.shapes.lock() })
    }
}
