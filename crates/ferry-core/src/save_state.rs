//! Save state machine for one continuously edited resource
//!
//! ```text
//!            edit (changes fingerprint)
//!   Saved ───────────────────────────────▶ Unsaved ◀──┐ edit restarts debounce
//!     ▲                                      │   └─────┘
//!     │ ack, nothing newer       debounce or │ flush trigger
//!     │                                      ▼
//!     └──────────────────────────────────── Saving ◀──┐ failure, budget left:
//!                                            │   └─────┘ retry after backoff
//!                       failure, no budget   ▼
//!                                          Error ──manual retry──▶ Saving
//! ```
//!
//! [`transition`] is pure: it takes the state and one event and returns the
//! next state plus the effects the caller must perform (arm a timer, transmit
//! a write, report a failure). Attempt ids and debounce generations let the
//! machine recognise and drop events that belong to a superseded timer or
//! write.

use crate::types::{Ack, Fingerprint, ResourceId, Snapshot};
use chrono::{DateTime, Utc};
use ferry_resilience::{RetryClassifier, RetryPolicy, SyncError, TransientOnly};
use std::sync::Arc;
use std::time::Duration;

/// Save status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveStatus {
    /// Remote copy matches local state
    Saved,
    /// Local edits not yet sent
    Unsaved,
    /// A write chain is in flight
    Saving,
    /// Retries exhausted; waiting for a manual retry or a new edit
    Error,
}

impl SaveStatus {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Unsaved => "unsaved",
            Self::Saving => "saving",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event that forces an immediate save, bypassing the debounce window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// Save button
    Manual,
    /// User opened another resource
    Switch,
    /// Window lost focus
    Blur,
    /// Window or tab is unloading
    Unload,
    /// Editor component torn down
    Teardown,
}

impl FlushTrigger {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Switch => "switch",
            Self::Blur => "blur",
            Self::Unload => "unload",
            Self::Teardown => "teardown",
        }
    }
}

/// Timing and retry rules for one controller
#[derive(Clone)]
pub struct SavePolicy {
    /// Quiet period before an automatic save
    pub debounce: Duration,
    /// Retry budget and backoff
    pub retry: RetryPolicy,
    /// Which failures are retried
    pub classifier: Arc<dyn RetryClassifier>,
}

impl SavePolicy {
    /// Policy retrying transient failures only
    #[must_use]
    pub fn new(debounce: Duration, retry: RetryPolicy) -> Self {
        Self {
            debounce,
            retry,
            classifier: Arc::new(TransientOnly),
        }
    }

    /// With custom classifier
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000), RetryPolicy::default())
    }
}

impl std::fmt::Debug for SavePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavePolicy")
            .field("debounce", &self.debounce)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum SaveEvent {
    /// Local state changed; carries the new fingerprint
    LocalEdit(Fingerprint),
    /// Debounce timer of `generation` fired
    DebounceElapsed {
        /// Generation the timer was armed with
        generation: u64,
        /// State captured when the timer fired
        snapshot: Snapshot,
    },
    /// Host asked for an immediate save
    Flush {
        /// What asked
        trigger: FlushTrigger,
        /// State captured at the trigger
        snapshot: Snapshot,
    },
    /// Write `attempt` finished
    WriteSettled {
        /// Attempt the result belongs to
        attempt: u64,
        /// Remote outcome
        outcome: Result<Ack, SyncError>,
    },
    /// Backoff before retrying `attempt` elapsed
    RetryElapsed {
        /// Attempt that failed
        attempt: u64,
    },
    /// User pressed retry after a terminal failure
    ManualRetry(Snapshot),
    /// Controller is being detached from its resource
    Detach,
}

/// Work the caller performs on behalf of the machine
#[derive(Debug, Clone, PartialEq)]
pub enum SaveEffect {
    /// (Re)arm the debounce timer, replacing any armed one
    ArmDebounce {
        /// Generation to echo back in `DebounceElapsed`
        generation: u64,
        /// Delay
        delay: Duration,
    },
    /// Cancel the armed debounce timer
    CancelDebounce,
    /// Cancel a scheduled retry
    CancelRetry,
    /// Send `snapshot` to the remote store
    Transmit {
        /// Attempt id to echo back in `WriteSettled`
        attempt: u64,
        /// State to write
        snapshot: Snapshot,
    },
    /// Schedule `RetryElapsed { attempt }` after `delay`
    ScheduleRetry {
        /// Attempt that failed
        attempt: u64,
        /// Backoff
        delay: Duration,
    },
    /// Surface a terminal failure to the user
    ReportFailure(SyncError),
    /// Remote store acknowledged `fingerprint`
    Acknowledged {
        /// Fingerprint now stored remotely
        fingerprint: Fingerprint,
        /// Remote acknowledgement
        ack: Ack,
    },
}

/// Save bookkeeping for one resource
#[derive(Debug, Clone, PartialEq)]
pub struct SaveState {
    resource_id: ResourceId,
    status: SaveStatus,
    last_acknowledged: Fingerprint,
    current: Fingerprint,
    pending: Option<Snapshot>,
    retry_count: u32,
    last_save_time: Option<DateTime<Utc>>,
    last_error: Option<SyncError>,
    attempt: u64,
    debounce_generation: u64,
    in_flight: bool,
    detached: bool,
}

impl SaveState {
    /// Fresh state for a just-loaded resource
    #[must_use]
    pub fn new(resource_id: ResourceId, loaded: Fingerprint) -> Self {
        Self {
            resource_id,
            status: SaveStatus::Saved,
            last_acknowledged: loaded,
            current: loaded,
            pending: None,
            retry_count: 0,
            last_save_time: None,
            last_error: None,
            attempt: 0,
            debounce_generation: 0,
            in_flight: false,
            detached: false,
        }
    }

    /// Resource this state belongs to
    #[inline]
    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Current status
    #[inline]
    #[must_use]
    pub fn status(&self) -> SaveStatus {
        self.status
    }

    /// Fingerprint the remote store is known to hold
    #[inline]
    #[must_use]
    pub fn last_acknowledged_fingerprint(&self) -> Fingerprint {
        self.last_acknowledged
    }

    /// Fingerprint of the write chain in flight, if any
    #[inline]
    #[must_use]
    pub fn pending_fingerprint(&self) -> Option<Fingerprint> {
        self.pending.as_ref().map(Snapshot::fingerprint)
    }

    /// Latest local fingerprint seen
    #[inline]
    #[must_use]
    pub fn current_fingerprint(&self) -> Fingerprint {
        self.current
    }

    /// Retries spent in the current chain
    #[inline]
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Time of the last acknowledged save
    #[inline]
    #[must_use]
    pub fn last_save_time(&self) -> Option<DateTime<Utc>> {
        self.last_save_time
    }

    /// Most recent write failure of the current chain
    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    /// Id of the most recent transmission
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Generation of the most recently armed debounce timer
    #[inline]
    #[must_use]
    pub fn debounce_generation(&self) -> u64 {
        self.debounce_generation
    }

    /// Whether a transmission is awaiting its result
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether the controller was detached from its resource
    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Detached and nothing left to wait for
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.detached && !self.in_flight
    }

    /// Whether local state differs from the remote copy
    #[inline]
    #[must_use]
    pub fn has_unacknowledged_changes(&self) -> bool {
        self.current != self.last_acknowledged
    }

    /// Adopt an authoritative remote fingerprint as both local and acknowledged
    pub(crate) fn rebase(&mut self, fingerprint: Fingerprint) {
        self.last_acknowledged = fingerprint;
        self.current = fingerprint;
    }

    fn arm_debounce(&mut self, policy: &SavePolicy, effects: &mut Vec<SaveEffect>) {
        self.debounce_generation += 1;
        effects.push(SaveEffect::ArmDebounce {
            generation: self.debounce_generation,
            delay: policy.debounce,
        });
    }

    fn on_edit(&mut self, fingerprint: Fingerprint, policy: &SavePolicy, effects: &mut Vec<SaveEffect>) {
        self.current = fingerprint;
        match self.status {
            SaveStatus::Saved => {
                if fingerprint != self.last_acknowledged {
                    self.status = SaveStatus::Unsaved;
                    self.arm_debounce(policy, effects);
                }
            }
            SaveStatus::Unsaved => self.arm_debounce(policy, effects),
            // Re-checked when the chain in flight resolves.
            SaveStatus::Saving => {}
            SaveStatus::Error => {
                self.status = SaveStatus::Unsaved;
                self.retry_count = 0;
                self.last_error = None;
                self.arm_debounce(policy, effects);
            }
        }
    }

    fn begin_save(&mut self, snapshot: Snapshot, effects: &mut Vec<SaveEffect>) {
        self.current = snapshot.fingerprint();
        self.retry_count = 0;
        self.last_error = None;

        if snapshot.fingerprint() == self.last_acknowledged {
            self.status = SaveStatus::Saved;
            self.pending = None;
            return;
        }

        self.status = SaveStatus::Saving;
        self.pending = Some(snapshot);
        self.transmit(effects);
    }

    fn transmit(&mut self, effects: &mut Vec<SaveEffect>) {
        if let Some(snapshot) = &self.pending {
            self.attempt += 1;
            self.in_flight = true;
            effects.push(SaveEffect::Transmit {
                attempt: self.attempt,
                snapshot: snapshot.clone(),
            });
        }
    }

    fn on_settled(
        &mut self,
        attempt: u64,
        outcome: Result<Ack, SyncError>,
        policy: &SavePolicy,
        now: DateTime<Utc>,
        effects: &mut Vec<SaveEffect>,
    ) {
        if self.status != SaveStatus::Saving || attempt != self.attempt || !self.in_flight {
            return;
        }
        self.in_flight = false;

        let Some(pending) = self.pending.clone() else {
            return;
        };

        match outcome {
            Ok(ack) => {
                self.last_acknowledged = pending.fingerprint();
                self.pending = None;
                self.retry_count = 0;
                self.last_save_time = Some(now);
                self.last_error = None;
                effects.push(SaveEffect::Acknowledged {
                    fingerprint: pending.fingerprint(),
                    ack,
                });

                if !self.detached && self.current != self.last_acknowledged {
                    self.status = SaveStatus::Unsaved;
                    self.arm_debounce(policy, effects);
                } else {
                    self.status = SaveStatus::Saved;
                }
            }
            Err(error) => {
                if self.detached {
                    self.status = SaveStatus::Error;
                    self.last_error = Some(error);
                    return;
                }

                let retry = policy.classifier.should_retry(&error)
                    && self.retry_count < policy.retry.max_retries;
                if retry {
                    let delay = policy.retry.delay_for(self.retry_count, &error);
                    self.retry_count += 1;
                    self.last_error = Some(error);
                    effects.push(SaveEffect::ScheduleRetry { attempt, delay });
                    return;
                }

                self.status = SaveStatus::Error;
                self.last_error = Some(error.clone());
                effects.push(SaveEffect::ReportFailure(error));

                if self.current != pending.fingerprint() {
                    self.status = SaveStatus::Unsaved;
                    self.pending = None;
                    self.retry_count = 0;
                    self.arm_debounce(policy, effects);
                }
            }
        }
    }

    fn on_detach(&mut self, effects: &mut Vec<SaveEffect>) {
        self.detached = true;
        effects.push(SaveEffect::CancelDebounce);
        effects.push(SaveEffect::CancelRetry);
        if self.status == SaveStatus::Saving && !self.in_flight {
            // Chain was waiting on a backoff that will now never fire.
            self.status = SaveStatus::Error;
        }
    }
}

/// Apply one event
///
/// `now` stamps `last_save_time` on acknowledgement. Events that do not apply
/// to the current state (stale timers, superseded results, flush triggers
/// outside `Unsaved`) leave the state unchanged and produce no effects.
#[must_use]
pub fn transition(
    mut state: SaveState,
    event: SaveEvent,
    policy: &SavePolicy,
    now: DateTime<Utc>,
) -> (SaveState, Vec<SaveEffect>) {
    let mut effects = Vec::new();

    if state.detached && !matches!(event, SaveEvent::WriteSettled { .. }) {
        return (state, effects);
    }

    match event {
        SaveEvent::LocalEdit(fingerprint) => state.on_edit(fingerprint, policy, &mut effects),
        SaveEvent::DebounceElapsed {
            generation,
            snapshot,
        } => {
            if state.status == SaveStatus::Unsaved && generation == state.debounce_generation {
                state.begin_save(snapshot, &mut effects);
            }
        }
        SaveEvent::Flush { snapshot, .. } => {
            if state.status == SaveStatus::Unsaved {
                effects.push(SaveEffect::CancelDebounce);
                state.begin_save(snapshot, &mut effects);
            }
        }
        SaveEvent::WriteSettled { attempt, outcome } => {
            state.on_settled(attempt, outcome, policy, now, &mut effects);
        }
        SaveEvent::RetryElapsed { attempt } => {
            if state.status == SaveStatus::Saving && attempt == state.attempt && !state.in_flight {
                state.transmit(&mut effects);
            }
        }
        SaveEvent::ManualRetry(snapshot) => match state.status {
            SaveStatus::Error => state.begin_save(snapshot, &mut effects),
            // A chain that failed with newer edits pending already moved on
            // to Unsaved; retrying saves those edits now.
            SaveStatus::Unsaved => {
                effects.push(SaveEffect::CancelDebounce);
                state.begin_save(snapshot, &mut effects);
            }
            SaveStatus::Saved | SaveStatus::Saving => {}
        },
        SaveEvent::Detach => state.on_detach(&mut effects),
    }

    (state, effects)
}
