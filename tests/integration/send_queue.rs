//! Integration tests for optimistic sending through the engine.
//!
//! Verifies:
//! 1. A send shows a placeholder at once and is replaced in place by the
//!    confirmed record, without a duplicate from the realtime echo.
//! 2. Offline sends fail after three attempts and stay visible as failed.
//! 3. A failed send can be retried once the network is back.
//! 4. Queued sends survive a restart and go out on the next session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use glimpse::backend::LocalMedia;
use glimpse::bus::{EventKind, SyncEvent};
use glimpse::config::SyncConfig;
use glimpse::engine::SyncEngine;
use glimpse::lifecycle::Lifecycle;
use glimpse::loopback::LoopbackBackend;
use glimpse::outbox::{OUTBOX_KEY, SendMode, SendState};
use glimpse::storage::MemoryStore;
use glimpse_proto::message::{MediaKind, UserId};

type Engine = SyncEngine<LoopbackBackend, LoopbackBackend, MemoryStore>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn engine_over(backend: &Arc<LoopbackBackend>, store: &Arc<MemoryStore>) -> Engine {
    SyncEngine::new(
        SyncConfig::default(),
        Arc::clone(backend),
        Arc::clone(backend),
        Arc::clone(store),
        Arc::new(Lifecycle::new()),
    )
}

async fn signed_in() -> (Engine, Arc<LoopbackBackend>, Arc<MemoryStore>) {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(&backend, &store);
    engine.initialize(alice()).await.unwrap();
    (engine, backend, store)
}

fn record(
    engine: &Engine,
    kind: EventKind,
) -> (Arc<Mutex<Vec<SyncEvent>>>, glimpse::bus::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = engine.subscribe(kind, move |e| sink.lock().push(e.clone()));
    (seen, sub)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn placeholder_is_replaced_by_confirmed_message() {
    let (engine, backend, _) = signed_in().await;
    let (added, _a) = record(&engine, EventKind::OptimisticAdded);
    let (replaced, _r) = record(&engine, EventKind::OptimisticReplaced);

    let temp_id = engine
        .send(&bob(), None, Some("hello".into()), SendMode::Standard)
        .await
        .unwrap();
    assert_eq!(added.lock().len(), 1);
    settle().await;

    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1, "realtime echo must not duplicate");
    assert!(!window[0].is_optimistic());
    assert_eq!(window[0].temp_id.as_ref(), Some(&temp_id));
    assert_eq!(window[0].caption.as_deref(), Some("hello"));

    let replaced = replaced.lock();
    assert_eq!(replaced.len(), 1);
    assert!(matches!(
        &replaced[0],
        SyncEvent::OptimisticReplaced { temp_id: t, .. } if *t == temp_id
    ));
    assert_eq!(backend.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn media_send_uploads_then_creates() {
    let (engine, backend, _) = signed_in().await;
    let media = LocalMedia {
        uri: "file:///photos/sunset.jpg".into(),
        kind: MediaKind::Image,
    };
    engine
        .send(&bob(), Some(media), None, SendMode::ViewOnce)
        .await
        .unwrap();
    settle().await;

    let stored = backend.messages();
    assert_eq!(stored.len(), 1);
    let sent = &stored[0];
    assert!(sent.flags.view_once);
    assert_eq!(
        sent.media.as_ref().map(|m| m.url.as_str()),
        Some("loopback://media/sunset.jpg")
    );
}

#[tokio::test(start_paused = true)]
async fn offline_send_fails_after_three_attempts_and_stays_visible() {
    let (engine, backend, _) = signed_in().await;
    backend.set_offline(true);
    let (statuses, _s) = record(&engine, EventKind::SendStatusChanged);

    let temp_id = engine
        .send(&bob(), None, Some("anyone there?".into()), SendMode::Standard)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(backend.create_attempts(), 3);
    let last = statuses.lock().last().cloned();
    assert!(matches!(
        last,
        Some(SyncEvent::SendStatusChanged { state: SendState::Failed, retries: 3, .. })
    ));

    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert!(window[0].has_identity(&temp_id));
    assert!(window[0].flags.failed);
    assert!(!window[0].flags.sending);
}

#[tokio::test(start_paused = true)]
async fn failed_send_can_be_retried() {
    let (engine, backend, _) = signed_in().await;
    backend.set_offline(true);
    let temp_id = engine
        .send(&bob(), None, Some("retry me".into()), SendMode::Standard)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    backend.set_offline(false);
    engine.retry_send(&temp_id).await.unwrap();
    settle().await;

    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert!(!window[0].is_optimistic());
    assert!(!window[0].flags.failed);
    assert_eq!(backend.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_removes_a_failed_send() {
    let (engine, backend, store) = signed_in().await;
    backend.set_offline(true);
    let temp_id = engine
        .send(&bob(), None, Some("never mind".into()), SendMode::Standard)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    engine.cancel_send(&temp_id).await.unwrap();
    assert!(engine.window(&bob()).unwrap().is_empty());
    assert!(!store.contains(OUTBOX_KEY));
}

#[tokio::test(start_paused = true)]
async fn queued_send_survives_restart() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.set_offline(true);

    let first = engine_over(&backend, &store);
    first.initialize(alice()).await.unwrap();
    let temp_id = first
        .send(&bob(), None, Some("later".into()), SendMode::Standard)
        .await
        .unwrap();
    settle().await;
    first.teardown().await;
    assert!(store.contains(OUTBOX_KEY));

    backend.set_offline(false);
    let second = engine_over(&backend, &store);
    second.initialize(alice()).await.unwrap();
    settle().await;

    let stored = backend.messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].temp_id.as_ref(), Some(&temp_id));
    let window = second.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert!(!window[0].is_optimistic());
}
