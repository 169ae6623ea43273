//! Inbound snapshot reconciliation
//!
//! Local wins until settled: a remote snapshot is applied only while the
//! resource is `Saved` with no write in flight. Otherwise it is dropped, not
//! queued, and the next save overwrites the remote copy. There is no merge.

use crate::remote::LocalView;
use crate::save_controller::SaveHandle;
use crate::save_state::{SaveState, SaveStatus};
use crate::types::Fingerprint;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What happened to an inbound snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileDecision {
    /// Applied to the local view; acknowledged fingerprint reset to match
    Applied,
    /// Matches what is already acknowledged; nothing to do
    AlreadyCurrent,
    /// Local work unsettled; snapshot dropped
    Deferred,
}

pub(crate) fn decide(state: &SaveState, inbound: Fingerprint) -> ReconcileDecision {
    let settled = state.status() == SaveStatus::Saved && !state.in_flight() && !state.is_detached();
    if !settled {
        return ReconcileDecision::Deferred;
    }
    if inbound == state.last_acknowledged_fingerprint() && inbound == state.current_fingerprint() {
        ReconcileDecision::AlreadyCurrent
    } else {
        ReconcileDecision::Applied
    }
}

/// Reconciliation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Snapshots applied
    pub applied: u64,
    /// Snapshots matching local state
    pub already_current: u64,
    /// Snapshots dropped while local work was unsettled
    pub deferred: u64,
}

/// Feeds authoritative snapshots into one view
#[derive(Debug)]
pub struct Reconciler<V> {
    view: Arc<V>,
    applied: AtomicU64,
    already_current: AtomicU64,
    deferred: AtomicU64,
}

impl<V: LocalView + 'static> Reconciler<V> {
    /// Create reconciler for `view`
    #[must_use]
    pub fn new(view: Arc<V>) -> Self {
        Self {
            view,
            applied: AtomicU64::new(0),
            already_current: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    /// View snapshots are applied to
    #[inline]
    #[must_use]
    pub fn view(&self) -> &Arc<V> {
        &self.view
    }

    /// Offer one snapshot for the resource behind `handle`
    pub async fn offer(&self, handle: &SaveHandle, body: Value) -> ReconcileDecision {
        let view: Arc<dyn LocalView> = self.view.clone();
        let decision = handle.offer_remote(body, view).await;
        let counter = match decision {
            ReconcileDecision::Applied => &self.applied,
            ReconcileDecision::AlreadyCurrent => &self.already_current,
            ReconcileDecision::Deferred => &self.deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        decision
    }

    /// Offer every snapshot from `inbound` until the sender closes
    pub async fn run(&self, handle: &SaveHandle, mut inbound: mpsc::Receiver<Value>) {
        while let Some(body) = inbound.recv().await {
            self.offer(handle, body).await;
        }
        tracing::debug!(resource = %handle.resource_id(), stats = ?self.stats(), "inbound snapshot stream closed");
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        ReconcileStats {
            applied: self.applied.load(Ordering::Relaxed),
            already_current: self.already_current.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}
