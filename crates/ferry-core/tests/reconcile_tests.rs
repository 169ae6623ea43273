use ferry_core::{
    EngineConfig, Fingerprint, ReconcileDecision, Reconciler, ResourceId, SaveEnvironment,
    SaveHandle, SaveStatus,
};
use ferry_resilience::CircuitBreaker;
use ferry_test_utils::{FakeDocumentStore, RecordingView, SharedDocument};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn spawn(store: Arc<FakeDocumentStore>, doc: Arc<SharedDocument>) -> SaveHandle {
    let config = EngineConfig::new();
    let breaker = Arc::new(CircuitBreaker::new("documents", config.breaker.breaker_config()));
    let env = SaveEnvironment::new(store, breaker, &config.save);
    SaveHandle::spawn(ResourceId::new("board"), doc, env).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_settled_resource_applies_remote_snapshot() {
    let store = Arc::new(FakeDocumentStore::new());
    let doc = SharedDocument::new(json!({ "cards": ["a"] }));
    let handle = spawn(store.clone(), doc.clone());
    let reconciler = Reconciler::new(doc.clone());

    let remote = json!({ "cards": ["a", "b"] });
    let decision = reconciler.offer(&handle, remote.clone()).await;
    assert_eq!(decision, ReconcileDecision::Applied);
    assert_eq!(doc.get(), remote);

    let state = handle.state();
    let expected = Fingerprint::of_value(&remote).unwrap();
    assert_eq!(state.last_acknowledged_fingerprint(), expected);
    assert_eq!(state.current_fingerprint(), expected);

    // Applying remote state is not a local edit
    handle.notify_edit();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.call_count(), 0);

    assert_eq!(reconciler.offer(&handle, remote).await, ReconcileDecision::AlreadyCurrent);
}

#[tokio::test(start_paused = true)]
async fn test_unsaved_edit_wins_over_remote_snapshot() {
    let store = Arc::new(FakeDocumentStore::new());
    let doc = SharedDocument::new(json!({ "cards": [] }));
    let handle = spawn(store.clone(), doc.clone());
    let view = RecordingView::new();
    let reconciler = Reconciler::new(view.clone());

    doc.set(json!({ "cards": ["local"] }));
    handle.notify_edit();

    let decision = reconciler.offer(&handle, json!({ "cards": ["remote"] })).await;
    assert_eq!(decision, ReconcileDecision::Deferred);
    assert!(view.applied().is_empty());

    // The local edit is still saved afterwards
    let mut rx = handle.subscribe();
    rx.wait_for(|s| s.status() == SaveStatus::Saved).await.unwrap();
    assert_eq!(store.calls()[0].body, json!({ "cards": ["local"] }));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_save_defers_remote_snapshot() {
    let store = Arc::new(FakeDocumentStore::new().with_latency(Duration::from_secs(3)));
    let doc = SharedDocument::new(json!({ "v": 0 }));
    let handle = spawn(store, doc.clone());
    let reconciler = Reconciler::new(RecordingView::new());

    doc.set(json!({ "v": 1 }));
    handle.notify_edit();
    handle.save_now();
    let mut rx = handle.subscribe();
    rx.wait_for(|s| s.status() == SaveStatus::Saving).await.unwrap();

    let decision = reconciler.offer(&handle, json!({ "v": 99 })).await;
    assert_eq!(decision, ReconcileDecision::Deferred);

    rx.wait_for(|s| s.status() == SaveStatus::Saved).await.unwrap();
    let decision = reconciler.offer(&handle, json!({ "v": 99 })).await;
    assert_eq!(decision, ReconcileDecision::Applied);
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_stream() {
    let store = Arc::new(FakeDocumentStore::new());
    let doc = SharedDocument::new(json!({ "v": 0 }));
    let handle = spawn(store, doc.clone());
    let reconciler = Reconciler::new(doc.clone());

    let (tx, rx) = mpsc::channel(8);
    tx.send(json!({ "v": 1 })).await.unwrap();
    tx.send(json!({ "v": 1 })).await.unwrap();
    tx.send(json!({ "v": 2 })).await.unwrap();
    drop(tx);

    reconciler.run(&handle, rx).await;
    let stats = reconciler.stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.already_current, 1);
    assert_eq!(stats.deferred, 0);
    assert_eq!(doc.get(), json!({ "v": 2 }));
}

#[tokio::test(start_paused = true)]
async fn test_stopped_controller_defers() {
    let doc = SharedDocument::new(json!({ "v": 0 }));
    let handle = spawn(Arc::new(FakeDocumentStore::new()), doc);
    handle.detach();
    handle.finished().await;

    let reconciler = Reconciler::new(RecordingView::new());
    assert_eq!(
        reconciler.offer(&handle, json!({ "v": 5 })).await,
        ReconcileDecision::Deferred
    );
}
