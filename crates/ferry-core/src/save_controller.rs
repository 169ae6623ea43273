//! Save controller actor
//!
//! One tokio task per edited resource owns its [`SaveState`]. Host hooks,
//! timer firings and write results all arrive in the task's mailbox, so the
//! state machine sees one event at a time and single-flight holds without
//! locking. Effects returned by [`transition`] are executed here: timers go
//! through the [`Scheduler`], writes are spawned through the circuit breaker
//! and timeout race.

use crate::config::SaveConfig;
use crate::reconcile::{self, ReconcileDecision};
use crate::remote::{DocumentStore, LocalView, SnapshotSource};
use crate::save_state::{
    transition, FlushTrigger, SaveEffect, SaveEvent, SavePolicy, SaveState, SaveStatus,
};
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use crate::sink::{FailureSink, RetryHandle, TerminalFailure, TracingSink};
use crate::types::{Ack, Fingerprint, ResourceId, Snapshot};
use chrono::Utc;
use ferry_resilience::{with_timeout, CircuitBreaker, SyncError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Mailbox messages
pub(crate) enum SaveCommand {
    Edit,
    Flush(FlushTrigger),
    DebounceFired(u64),
    RetryFired(u64),
    WriteSettled {
        attempt: u64,
        outcome: Result<Ack, SyncError>,
    },
    ManualRetry,
    Inbound {
        body: Value,
        view: Arc<dyn LocalView>,
        reply: oneshot::Sender<ReconcileDecision>,
    },
    Detach,
}

/// Collaborators shared by every controller of an editor
#[derive(Clone)]
pub struct SaveEnvironment {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn FailureSink>,
    scheduler: Arc<dyn Scheduler>,
    policy: SavePolicy,
    write_timeout: Duration,
}

impl SaveEnvironment {
    /// Environment writing to `store` through `breaker`
    ///
    /// Defaults to [`TracingSink`] and [`TokioScheduler`].
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, breaker: Arc<CircuitBreaker>, config: &SaveConfig) -> Self {
        Self {
            store,
            breaker,
            sink: Arc::new(TracingSink),
            scheduler: Arc::new(TokioScheduler::new()),
            policy: SavePolicy::new(config.debounce(), config.retry_policy()),
            write_timeout: config.write_timeout(),
        }
    }

    /// With failure sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    /// With scheduler
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// With save policy
    #[must_use]
    pub fn with_policy(mut self, policy: SavePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Breaker guarding the store
    #[inline]
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Save policy in use
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &SavePolicy {
        &self.policy
    }
}

impl std::fmt::Debug for SaveEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveEnvironment")
            .field("breaker", &self.breaker.name())
            .field("policy", &self.policy)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

/// Host-facing handle to a running controller
///
/// Hooks are fire-and-forget. Once the controller has stopped they are
/// ignored. Dropping every clone without [`SaveHandle::teardown`] makes the
/// controller write any unsaved edits once and stop.
#[derive(Debug, Clone)]
pub struct SaveHandle {
    resource_id: ResourceId,
    tx: mpsc::UnboundedSender<SaveCommand>,
    state: watch::Receiver<SaveState>,
}

impl SaveHandle {
    /// Spawn a controller for `resource_id`
    ///
    /// The last acknowledged fingerprint is seeded from the current snapshot,
    /// so a freshly loaded resource starts `Saved`.
    ///
    /// # Errors
    /// `SyncError::Validation` if the initial snapshot cannot be serialized
    pub fn spawn(
        resource_id: ResourceId,
        source: Arc<dyn SnapshotSource>,
        env: SaveEnvironment,
    ) -> Result<Self, SyncError> {
        let loaded = Fingerprint::of_value(&source.snapshot())?;
        let state = SaveState::new(resource_id.clone(), loaded);
        let (tx, rx) = mpsc::unbounded_channel();
        let (publish, watch_rx) = watch::channel(state.clone());

        let task = ControllerTask {
            state,
            env,
            source,
            mailbox: tx.downgrade(),
            rx,
            publish,
            debounce: None,
            retry: None,
        };
        tracing::debug!(resource = %resource_id, fingerprint = %loaded.short(), "save controller started");
        tokio::spawn(task.run());

        Ok(Self {
            resource_id,
            tx,
            state: watch_rx,
        })
    }

    /// Resource this controller saves
    #[inline]
    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    fn send(&self, command: SaveCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!(resource = %self.resource_id, "save controller stopped, hook ignored");
        }
    }

    /// Local state changed
    pub fn notify_edit(&self) {
        self.send(SaveCommand::Edit);
    }

    /// Save immediately
    pub fn flush(&self, trigger: FlushTrigger) {
        self.send(SaveCommand::Flush(trigger));
    }

    /// Manual save button
    pub fn save_now(&self) {
        self.flush(FlushTrigger::Manual);
    }

    /// Window lost focus
    pub fn blur(&self) {
        self.flush(FlushTrigger::Blur);
    }

    /// Window or tab is unloading
    ///
    /// Best effort: the write is started but may not finish before the host
    /// goes away.
    pub fn unload(&self) {
        self.flush(FlushTrigger::Unload);
    }

    /// Editor torn down: flush, then detach
    pub fn teardown(&self) {
        self.flush(FlushTrigger::Teardown);
        self.detach();
    }

    /// Retry after a terminal failure
    pub fn retry(&self) {
        self.send(SaveCommand::ManualRetry);
    }

    /// Stop reacting to hooks and timers
    ///
    /// A write already in flight still settles; the controller stops once it
    /// has.
    pub fn detach(&self) {
        self.send(SaveCommand::Detach);
    }

    /// Copy of the latest published state
    #[must_use]
    pub fn state(&self) -> SaveState {
        self.state.borrow().clone()
    }

    /// Latest published status
    #[must_use]
    pub fn status(&self) -> SaveStatus {
        self.state.borrow().status()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SaveState> {
        self.state.clone()
    }

    /// Whether the controller task has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the controller is detached with nothing in flight
    pub async fn finished(&self) {
        let mut rx = self.state.clone();
        // A closed channel means the task already exited.
        let _ = rx.wait_for(SaveState::is_finished).await;
    }

    /// Offer an authoritative remote snapshot
    ///
    /// Decided on the controller task, so no edit can slip in between the
    /// check and the apply. Returns `Deferred` if the controller has stopped.
    pub async fn offer_remote(&self, body: Value, view: Arc<dyn LocalView>) -> ReconcileDecision {
        let (reply, rx) = oneshot::channel();
        self.send(SaveCommand::Inbound { body, view, reply });
        rx.await.unwrap_or(ReconcileDecision::Deferred)
    }
}

struct ControllerTask {
    state: SaveState,
    env: SaveEnvironment,
    source: Arc<dyn SnapshotSource>,
    mailbox: mpsc::WeakUnboundedSender<SaveCommand>,
    rx: mpsc::UnboundedReceiver<SaveCommand>,
    publish: watch::Sender<SaveState>,
    debounce: Option<TimerHandle>,
    retry: Option<TimerHandle>,
}

impl ControllerTask {
    async fn run(mut self) {
        loop {
            let Some(command) = self.rx.recv().await else {
                self.flush_orphaned().await;
                break;
            };
            self.handle(command);
            self.publish.send_replace(self.state.clone());
            if self.state.is_finished() {
                break;
            }
        }
        self.cancel_debounce();
        self.cancel_retry();
        tracing::debug!(resource = %self.state.resource_id(), status = %self.state.status(), "save controller stopped");
    }

    fn capture(&self) -> Option<Snapshot> {
        match Snapshot::capture(self.source.snapshot()) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(resource = %self.state.resource_id(), "cannot capture snapshot: {}", e);
                None
            }
        }
    }

    fn handle(&mut self, command: SaveCommand) {
        let event = match command {
            SaveCommand::Edit => match self.capture() {
                Some(snapshot) => SaveEvent::LocalEdit(snapshot.fingerprint()),
                None => return,
            },
            SaveCommand::Flush(trigger) => match self.capture() {
                Some(snapshot) => {
                    tracing::debug!(resource = %self.state.resource_id(), trigger = trigger.as_str(), "flush requested");
                    SaveEvent::Flush { trigger, snapshot }
                }
                None => return,
            },
            SaveCommand::DebounceFired(generation) => {
                // A stale firing must not forget the handle of the timer
                // that replaced it.
                if generation == self.state.debounce_generation() {
                    self.debounce = None;
                }
                match self.capture() {
                    Some(snapshot) => SaveEvent::DebounceElapsed {
                        generation,
                        snapshot,
                    },
                    None => return,
                }
            }
            SaveCommand::RetryFired(attempt) => {
                if attempt == self.state.attempt() {
                    self.retry = None;
                }
                SaveEvent::RetryElapsed { attempt }
            }
            SaveCommand::WriteSettled { attempt, outcome } => {
                if attempt != self.state.attempt() {
                    tracing::debug!(resource = %self.state.resource_id(), attempt, "ignoring superseded write result");
                }
                SaveEvent::WriteSettled { attempt, outcome }
            }
            SaveCommand::ManualRetry => match self.capture() {
                Some(snapshot) => SaveEvent::ManualRetry(snapshot),
                None => return,
            },
            SaveCommand::Inbound { body, view, reply } => {
                let decision = self.reconcile(&body, view.as_ref());
                let _ = reply.send(decision);
                return;
            }
            SaveCommand::Detach => SaveEvent::Detach,
        };

        for effect in self.step(event) {
            self.execute(effect);
        }
    }

    fn step(&mut self, event: SaveEvent) -> Vec<SaveEffect> {
        let before = self.state.status();
        let (next, effects) = transition(self.state.clone(), event, &self.env.policy, Utc::now());
        self.state = next;
        if before != self.state.status() {
            tracing::debug!(
                resource = %self.state.resource_id(),
                from = %before,
                to = %self.state.status(),
                "save status changed"
            );
        }
        effects
    }

    /// Every handle was dropped without a teardown
    ///
    /// Timers hold only weak senders and can no longer reach the mailbox, so
    /// pending work is written once here, inline and without retries. No
    /// write can be in flight: its task holds a sender until it reports.
    async fn flush_orphaned(&mut self) {
        if self.state.is_detached() || !self.state.has_unacknowledged_changes() {
            return;
        }
        tracing::warn!(
            resource = %self.state.resource_id(),
            status = %self.state.status(),
            "all handles dropped with unsaved changes, flushing"
        );

        let event = match self.state.status() {
            SaveStatus::Unsaved => match self.capture() {
                Some(snapshot) => SaveEvent::Flush {
                    trigger: FlushTrigger::Teardown,
                    snapshot,
                },
                None => return,
            },
            SaveStatus::Saving if !self.state.in_flight() => SaveEvent::RetryElapsed {
                attempt: self.state.attempt(),
            },
            // An exhausted chain waits for the user, who is gone.
            _ => return,
        };

        let mut effects = self.step(event);
        effects.extend(self.step(SaveEvent::Detach));
        for effect in effects {
            match effect {
                SaveEffect::Transmit { attempt, snapshot } => {
                    let store = Arc::clone(&self.env.store);
                    let breaker = Arc::clone(&self.env.breaker);
                    let limit = self.env.write_timeout;
                    let resource = self.state.resource_id().clone();
                    let outcome = breaker
                        .call(|| with_timeout(limit, store.save(&resource, snapshot.body())))
                        .await;
                    if let Err(e) = &outcome {
                        tracing::error!(resource = %resource, "final save failed: {}", e);
                    }
                    for effect in self.step(SaveEvent::WriteSettled { attempt, outcome }) {
                        self.execute(effect);
                    }
                }
                other => self.execute(other),
            }
        }
        self.publish.send_replace(self.state.clone());
    }

    fn reconcile(&mut self, body: &Value, view: &dyn LocalView) -> ReconcileDecision {
        let fingerprint = match Fingerprint::of_value(body) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::warn!(resource = %self.state.resource_id(), "dropping unreadable remote snapshot: {}", e);
                return ReconcileDecision::Deferred;
            }
        };

        let decision = reconcile::decide(&self.state, fingerprint);
        match decision {
            ReconcileDecision::Applied => {
                view.apply_remote(body);
                self.state.rebase(fingerprint);
                tracing::debug!(resource = %self.state.resource_id(), fingerprint = %fingerprint.short(), "applied remote snapshot");
            }
            ReconcileDecision::AlreadyCurrent => {}
            ReconcileDecision::Deferred => {
                tracing::warn!(
                    resource = %self.state.resource_id(),
                    status = %self.state.status(),
                    "local changes unsettled, dropping remote snapshot"
                );
            }
        }
        decision
    }

    fn execute(&mut self, effect: SaveEffect) {
        match effect {
            SaveEffect::ArmDebounce { generation, delay } => {
                self.cancel_debounce();
                self.debounce = Some(self.schedule(delay, SaveCommand::DebounceFired(generation)));
            }
            SaveEffect::CancelDebounce => self.cancel_debounce(),
            SaveEffect::CancelRetry => self.cancel_retry(),
            SaveEffect::Transmit { attempt, snapshot } => self.transmit(attempt, snapshot),
            SaveEffect::ScheduleRetry { attempt, delay } => {
                tracing::warn!(
                    resource = %self.state.resource_id(),
                    retry = self.state.retry_count(),
                    max_retries = self.env.policy.retry.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "save failed, retrying: {}",
                    self.state.last_error().map(ToString::to_string).unwrap_or_default()
                );
                self.cancel_retry();
                self.retry = Some(self.schedule(delay, SaveCommand::RetryFired(attempt)));
            }
            SaveEffect::ReportFailure(error) => {
                tracing::error!(
                    resource = %self.state.resource_id(),
                    kind = %error.kind(),
                    retries = self.state.retry_count(),
                    "save failed: {}",
                    error
                );
                self.env.sink.terminal_failure(TerminalFailure {
                    resource_id: self.state.resource_id().clone(),
                    error,
                    retry: RetryHandle::new(self.mailbox.clone()),
                });
            }
            SaveEffect::Acknowledged { fingerprint, ack } => {
                tracing::info!(
                    resource = %self.state.resource_id(),
                    fingerprint = %fingerprint.short(),
                    revision = ?ack.revision,
                    "saved"
                );
            }
        }
    }

    fn schedule(&self, delay: Duration, command: SaveCommand) -> TimerHandle {
        let mailbox = self.mailbox.clone();
        self.env.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(tx) = mailbox.upgrade() {
                    let _ = tx.send(command);
                }
            }),
        )
    }

    fn cancel_debounce(&mut self) {
        if let Some(handle) = self.debounce.take() {
            self.env.scheduler.cancel(handle);
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            self.env.scheduler.cancel(handle);
        }
    }

    fn transmit(&self, attempt: u64, snapshot: Snapshot) {
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.env.store);
        let breaker = Arc::clone(&self.env.breaker);
        let limit = self.env.write_timeout;
        let resource = self.state.resource_id().clone();

        tracing::debug!(resource = %resource, attempt, fingerprint = %snapshot.fingerprint().short(), "transmitting save");
        tokio::spawn(async move {
            let outcome = breaker
                .call(|| with_timeout(limit, store.save(&resource, snapshot.body())))
                .await;
            let _ = tx.send(SaveCommand::WriteSettled { attempt, outcome });
        });
    }
}
