use ferry_core::{
    EngineConfig, ResourceId, SaveEnvironment, SaveHandle, SaveState, SaveStatus, TokioScheduler,
};
use ferry_resilience::{CircuitBreaker, CircuitState, ErrorKind, SyncError, OPEN_MESSAGE};
use ferry_test_utils::{FakeDocumentStore, ManualScheduler, RecordingSink, SharedDocument};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Fixture {
    store: Arc<FakeDocumentStore>,
    sink: Arc<RecordingSink>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Arc<TokioScheduler>,
    doc: Arc<SharedDocument>,
    handle: SaveHandle,
}

fn fixture(store: FakeDocumentStore) -> Fixture {
    let config = EngineConfig::new();
    let store = Arc::new(store);
    let sink = RecordingSink::new();
    let breaker = Arc::new(CircuitBreaker::new("documents", config.breaker.breaker_config()));
    let scheduler = Arc::new(TokioScheduler::new());
    let env = SaveEnvironment::new(store.clone(), breaker.clone(), &config.save)
        .with_sink(sink.clone())
        .with_scheduler(scheduler.clone());

    let doc = SharedDocument::new(json!({ "shapes": [] }));
    let handle = SaveHandle::spawn(ResourceId::new("canvas-1"), doc.clone(), env).unwrap();
    Fixture {
        store,
        sink,
        breaker,
        scheduler,
        doc,
        handle,
    }
}

async fn wait_for(handle: &SaveHandle, check: impl Fn(&SaveState) -> bool) {
    let mut rx = handle.subscribe();
    rx.wait_for(|s| check(s)).await.unwrap();
}

fn elapsed_ms(start: Instant, at: Instant) -> u128 {
    at.duration_since(start).as_millis()
}

#[tokio::test(start_paused = true)]
async fn test_edit_and_revert_before_debounce_makes_no_call() {
    let f = fixture(FakeDocumentStore::new());

    f.doc.set(json!({ "shapes": [{ "kind": "rect" }] }));
    f.handle.notify_edit();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Unsaved).await;

    f.doc.set(json!({ "shapes": [] }));
    f.handle.notify_edit();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(f.store.call_count(), 0);
    assert_eq!(f.handle.status(), SaveStatus::Saved);
    assert_eq!(f.scheduler.live_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_on_saved_resource_makes_no_call() {
    let f = fixture(FakeDocumentStore::new());
    f.handle.save_now();
    f.handle.blur();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.store.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_restarts_on_each_edit() {
    let f = fixture(FakeDocumentStore::new());
    let start = Instant::now();

    for n in 1..=3 {
        f.doc.set(json!({ "shapes": [n] }));
        f.handle.notify_edit();
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }
    assert_eq!(f.store.call_count(), 0);

    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;
    let calls = f.store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body, json!({ "shapes": [3] }));
    assert_eq!(elapsed_ms(start, calls[0].at), 3000 + 2000);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_while_saving() {
    let f = fixture(FakeDocumentStore::new().with_latency(Duration::from_secs(5)));

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saving).await;

    // Edits and triggers while the first write is outstanding
    f.doc.set(json!({ "shapes": [1, 2] }));
    f.handle.notify_edit();
    f.handle.save_now();
    f.handle.blur();
    f.handle.unload();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.store.call_count(), 1);

    // First ack lands, the newer edit goes back through the debounce
    wait_for(&f.handle, |s| s.status() == SaveStatus::Unsaved).await;
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;

    let calls = f.store.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].body, json!({ "shapes": [1, 2] }));
    assert_eq!(f.store.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_then_terminal_error() {
    let f = fixture(FakeDocumentStore::failing(SyncError::network("connection refused")));
    let start = Instant::now();

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;

    let times: Vec<u128> = f.store.calls().iter().map(|c| elapsed_ms(start, c.at)).collect();
    assert_eq!(times, vec![0, 1000, 3000, 7000]);

    assert_eq!(f.sink.count(), 1);
    assert_eq!(elapsed_ms(start, f.sink.reported_at()[0]), 7000);
    let failure = &f.sink.failures()[0];
    assert_eq!(failure.resource_id, ResourceId::new("canvas-1"));
    assert_eq!(failure.error.kind(), ErrorKind::Network);

    let state = f.handle.state();
    assert_eq!(state.retry_count(), 3);
    assert_eq!(f.breaker.state(), CircuitState::Closed);

    // No further attempts without user action
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.store.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_manual_retry_resets_state() {
    let f = fixture(FakeDocumentStore::failing(SyncError::network("offline")));

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;
    assert_eq!(f.store.call_count(), 4);

    f.store.set_fallback(Ok(ferry_core::Ack::with_revision("r2")));
    let retry_at = Instant::now();
    assert!(f.sink.failures()[0].retry.retry());
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;

    let calls = f.store.calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(elapsed_ms(retry_at, calls[4].at), 0);

    let state = f.handle.state();
    assert_eq!(state.retry_count(), 0);
    assert!(state.last_error().is_none());
    assert!(!state.has_unacknowledged_changes());
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_is_not_retried() {
    let f = fixture(FakeDocumentStore::failing(
        SyncError::validation("too many shapes").with_field("shapes"),
    ));

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(f.store.call_count(), 1);
    assert_eq!(f.sink.count(), 1);
    assert_eq!(f.sink.failures()[0].error.kind(), ErrorKind::Validation);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_retry_after() {
    let store = FakeDocumentStore::new();
    store.push_outcome(Err(SyncError::rate_limit(
        "slow down",
        Some(Duration::from_millis(2500)),
    )));
    let f = fixture(store);
    let start = Instant::now();

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;

    let times: Vec<u128> = f.store.calls().iter().map(|c| elapsed_ms(start, c.at)).collect();
    assert_eq!(times, vec![0, 2500]);
}

#[tokio::test(start_paused = true)]
async fn test_edit_after_error_restarts_chain() {
    let f = fixture(FakeDocumentStore::failing(SyncError::authentication("expired")));

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;

    f.store.set_fallback(Ok(ferry_core::Ack::new()));
    f.doc.set(json!({ "shapes": [1, 2] }));
    f.handle.notify_edit();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Unsaved).await;
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;

    assert_eq!(f.store.call_count(), 2);
    assert_eq!(f.sink.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_write_times_out_and_late_result_is_ignored() {
    let store = FakeDocumentStore::new().with_latency(Duration::from_secs(15));
    let f = fixture(store);
    let start = Instant::now();

    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;

    // 10s ceiling per write, then 1s, 2s, 4s backoff
    let times: Vec<u128> = f.store.calls().iter().map(|c| elapsed_ms(start, c.at)).collect();
    assert_eq!(times, vec![0, 11_000, 23_000, 37_000]);
    assert!(f.sink.failures()[0].error.to_string().contains("timed out after 10000ms"));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_fails_fast_across_chains() {
    let f = fixture(FakeDocumentStore::failing(SyncError::external("docs-api", "503")));

    // First chain: 4 real failures
    f.doc.set(json!({ "shapes": [1] }));
    f.handle.notify_edit();
    f.handle.save_now();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;
    assert_eq!(f.store.call_count(), 4);

    // Second chain: the fifth failure opens the breaker, retries never reach the store
    f.doc.set(json!({ "shapes": [1, 2] }));
    f.handle.notify_edit();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Unsaved).await;
    wait_for(&f.handle, |s| s.status() == SaveStatus::Error).await;
    assert_eq!(f.store.call_count(), 5);
    assert_eq!(f.breaker.state(), CircuitState::Open);
    assert_eq!(
        f.sink.failures()[1].error,
        SyncError::network(OPEN_MESSAGE)
    );

    // After the cooldown the trial call goes through and closes the breaker
    f.store.set_fallback(Ok(ferry_core::Ack::new()));
    tokio::time::sleep(Duration::from_secs(60)).await;
    f.handle.retry();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Saved).await;
    assert_eq!(f.store.call_count(), 6);
    assert_eq!(f.breaker.state(), CircuitState::Closed);
    assert_eq!(f.breaker.snapshot().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_flushes_then_stops() {
    let f = fixture(FakeDocumentStore::new());

    f.doc.set(json!({ "shapes": [7] }));
    f.handle.notify_edit();
    f.handle.teardown();
    f.handle.finished().await;

    assert_eq!(f.store.call_count(), 1);
    assert_eq!(f.store.calls()[0].body, json!({ "shapes": [7] }));
    assert_eq!(f.scheduler.live_timers(), 0);

    // Hooks after teardown are ignored
    f.doc.set(json!({ "shapes": [8] }));
    f.handle.notify_edit();
    f.handle.save_now();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.store.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_debounce_message_keeps_newer_timer_cancellable() {
    let config = EngineConfig::new();
    let store = Arc::new(FakeDocumentStore::new());
    let scheduler = ManualScheduler::new();
    let breaker = Arc::new(CircuitBreaker::new("documents", config.breaker.breaker_config()));
    let env = SaveEnvironment::new(store.clone(), breaker, &config.save).with_scheduler(scheduler.clone());
    let doc = SharedDocument::new(json!({ "v": 0 }));
    let handle = SaveHandle::spawn(ResourceId::new("canvas-2"), doc.clone(), env).unwrap();

    doc.set(json!({ "v": 1 }));
    handle.notify_edit();
    wait_for(&handle, |s| s.debounce_generation() == 1).await;
    // First timer expired, its message not yet delivered
    let expired = scheduler.take_next().unwrap();

    doc.set(json!({ "v": 2 }));
    handle.notify_edit();
    wait_for(&handle, |s| s.debounce_generation() == 2).await;
    assert_eq!(scheduler.live(), 1);

    expired();
    handle.detach();
    handle.finished().await;

    assert_eq!(scheduler.live(), 0);
    assert_eq!(store.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_flushes_unsaved_edits() {
    let f = fixture(FakeDocumentStore::new());
    f.doc.set(json!({ "shapes": [{ "kind": "ellipse" }] }));
    f.handle.notify_edit();
    wait_for(&f.handle, |s| s.status() == SaveStatus::Unsaved).await;

    let mut rx = f.handle.subscribe();
    let start = Instant::now();
    drop(f.handle);
    rx.wait_for(|s| s.status() == SaveStatus::Saved).await.unwrap();

    let calls = f.store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body, json!({ "shapes": [{ "kind": "ellipse" }] }));
    // Written straight away, not when the debounce would have fired
    assert!(elapsed_ms(start, calls[0].at) < 2000);
    assert!(rx.borrow().is_detached());
}
