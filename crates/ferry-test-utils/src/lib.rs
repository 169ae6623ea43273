//! Testing utilities for Ferry workspace
//!
//! Scripted fakes for the engine's collaborators.

#![allow(missing_docs)]

use ferry_core::{
    Ack, DocumentStore, EntityId, FailureSink, LocalView, RemoteMutations, ResourceId, Scheduler,
    SnapshotSource, TerminalFailure, TimerCallback, TimerHandle,
};
use ferry_resilience::SyncError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SaveCall {
    pub resource: ResourceId,
    pub body: Value,
    pub at: Instant,
}

/// Document store answering from a script, then from a fallback outcome
#[derive(Debug)]
pub struct FakeDocumentStore {
    script: Mutex<VecDeque<Result<Ack, SyncError>>>,
    fallback: Mutex<Result<Ack, SyncError>>,
    latency: Duration,
    calls: Mutex<Vec<SaveCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeDocumentStore {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(Ack::new())),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Store that fails every call with `error`
    pub fn failing(error: SyncError) -> Self {
        let store = Self::new();
        *store.fallback.lock() = Err(error);
        store
    }

    /// Each call takes `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer the next unscripted call with `outcome`
    pub fn push_outcome(&self, outcome: Result<Ack, SyncError>) {
        self.script.lock().push_back(outcome);
    }

    /// Answer every call after the script runs out with `outcome`
    pub fn set_fallback(&self, outcome: Result<Ack, SyncError>) {
        *self.fallback.lock() = outcome;
    }

    pub fn calls(&self) -> Vec<SaveCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, resource: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.resource.as_str() == resource)
            .count()
    }

    /// Highest number of calls that were outstanding at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for FakeDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for FakeDocumentStore {
    async fn save(&self, resource: &ResourceId, body: &Value) -> Result<Ack, SyncError> {
        self.calls.lock().push(SaveCall {
            resource: resource.clone(),
            body: body.clone(),
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().pop_front();
        let outcome = scripted.unwrap_or_else(|| self.fallback.lock().clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Remote mutation set failing for chosen entities
#[derive(Debug, Default)]
pub struct FakeMutations {
    failures: Mutex<HashMap<EntityId, SyncError>>,
    calls: Mutex<Vec<(&'static str, EntityId)>>,
}

impl FakeMutations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call touching `entity` fails with `error`
    pub fn fail_entity(&self, entity: impl Into<EntityId>, error: SyncError) {
        self.failures.lock().insert(entity.into(), error);
    }

    /// Calls touching `entity` succeed again
    pub fn heal_entity(&self, entity: &str) {
        self.failures.lock().remove(&EntityId::new(entity));
    }

    /// `(mutation, entity)` in call order
    pub fn calls(&self) -> Vec<(&'static str, EntityId)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, entity: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(_, e)| e.as_str() == entity)
            .count()
    }

    fn answer(&self, mutation: &'static str, entity: &EntityId) -> Result<Ack, SyncError> {
        self.calls.lock().push((mutation, entity.clone()));
        match self.failures.lock().get(entity) {
            Some(error) => Err(error.clone()),
            None => Ok(Ack::new()),
        }
    }
}

#[async_trait::async_trait]
impl RemoteMutations for FakeMutations {
    async fn create(&self, entity: &EntityId, _payload: &Value) -> Result<Ack, SyncError> {
        self.answer("create", entity)
    }

    async fn update(&self, entity: &EntityId, _payload: &Value) -> Result<Ack, SyncError> {
        self.answer("update", entity)
    }

    async fn delete(&self, entity: &EntityId) -> Result<Ack, SyncError> {
        self.answer("delete", entity)
    }
}

/// Editable document exposing its state as a snapshot source
#[derive(Debug)]
pub struct SharedDocument {
    state: Mutex<Value>,
}

impl SharedDocument {
    pub fn new(initial: Value) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
        })
    }

    pub fn set(&self, value: Value) {
        *self.state.lock() = value;
    }

    pub fn get(&self) -> Value {
        self.state.lock().clone()
    }
}

impl SnapshotSource for SharedDocument {
    fn snapshot(&self) -> Value {
        self.get()
    }
}

impl LocalView for SharedDocument {
    fn apply_remote(&self, body: &Value) {
        self.set(body.clone());
    }
}

/// View recording every applied snapshot
#[derive(Debug, Default)]
pub struct RecordingView {
    applied: Mutex<Vec<Value>>,
}

impl RecordingView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> Vec<Value> {
        self.applied.lock().clone()
    }
}

impl LocalView for RecordingView {
    fn apply_remote(&self, body: &Value) {
        self.applied.lock().push(body.clone());
    }
}

/// Sink recording every terminal failure
#[derive(Debug, Default)]
pub struct RecordingSink {
    failures: Mutex<Vec<(TerminalFailure, Instant)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failures(&self) -> Vec<TerminalFailure> {
        self.failures.lock().iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.failures.lock().len()
    }

    /// When each failure was reported
    pub fn reported_at(&self) -> Vec<Instant> {
        self.failures.lock().iter().map(|(_, at)| *at).collect()
    }
}

impl FailureSink for RecordingSink {
    fn terminal_failure(&self, failure: TerminalFailure) {
        self.failures.lock().push((failure, Instant::now()));
    }
}

/// Scheduler whose timers only fire when the test fires them
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    timers: Mutex<Vec<(TimerHandle, TimerCallback)>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Timers neither cancelled nor taken
    pub fn live(&self) -> usize {
        self.timers.lock().len()
    }

    /// Remove the oldest timer and return its callback unfired
    ///
    /// Models a timer that has expired but whose message has not been
    /// delivered yet.
    pub fn take_next(&self) -> Option<TimerCallback> {
        let mut timers = self.timers.lock();
        if timers.is_empty() {
            None
        } else {
            Some(timers.remove(0).1)
        }
    }

    /// Fire the oldest timer; `false` if none is live
    pub fn fire_next(&self) -> bool {
        match self.take_next() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("live", &self.live())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, _delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.timers.lock().push((handle, callback));
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.timers.lock().retain(|(h, _)| *h != handle);
    }
}
