//! Integration tests for the sliding conversation window.
//!
//! Verifies:
//! 1. Windows are ordered oldest first and capped at the configured size.
//! 2. Opening a conversation paints from cache and refreshes behind it.
//! 3. In-flight sends grow the window instead of evicting history.
//! 4. Older pages extend the window on demand.

use std::sync::Arc;

use glimpse::config::SyncConfig;
use glimpse::engine::SyncEngine;
use glimpse::lifecycle::Lifecycle;
use glimpse::loopback::LoopbackBackend;
use glimpse::outbox::SendMode;
use glimpse::storage::MemoryStore;
use glimpse_proto::message::{Message, MessageId, Timestamp, UserId};

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

/// Seed `n` alternating messages with ids `1..=n`.
fn seed(backend: &LoopbackBackend, n: u64) {
    for i in 1..=n {
        let (from, to) = if i % 2 == 0 {
            (alice(), bob())
        } else {
            (bob(), alice())
        };
        backend.seed(
            Message::authoritative(i.to_string(), &from, &to, Timestamp::from_millis(i * 1_000))
                .with_caption(format!("message {i}")),
        );
    }
}

async fn signed_in(backend: &Arc<LoopbackBackend>) -> Engine {
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Arc::clone(backend),
        Arc::clone(backend),
        Arc::new(MemoryStore::new()),
        Arc::new(Lifecycle::new()),
    );
    engine.initialize(alice()).await.unwrap();
    engine
}

fn ids(window: &[Message]) -> Vec<String> {
    window
        .iter()
        .filter_map(|m| m.id.as_ref().map(|id| id.as_str().to_string()))
        .collect()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_messages_are_shown_oldest_first() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 3);
    let engine = signed_in(&backend).await;

    let window = engine.refresh_conversation(&bob()).await.unwrap();
    assert_eq!(ids(&window), ["1", "2", "3"]);
    assert_eq!(ids(&engine.window(&bob()).unwrap()), ["1", "2", "3"]);
}

#[tokio::test]
async fn twelve_messages_project_the_latest_ten() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 12);
    let engine = signed_in(&backend).await;

    engine.refresh_conversation(&bob()).await.unwrap();
    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 10);
    assert_eq!(ids(&window).first().map(String::as_str), Some("3"));
    assert_eq!(ids(&window).last().map(String::as_str), Some("12"));
}

#[tokio::test]
async fn open_without_cache_refreshes_in_background() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 12);
    let engine = signed_in(&backend).await;

    let view = engine.open_conversation(&bob()).unwrap();
    assert!(view.messages.is_empty());
    assert!(!view.cached);
    assert!(view.refreshing);
    settle().await;

    assert_eq!(engine.window(&bob()).unwrap().len(), 10);
    let again = engine.open_conversation(&bob()).unwrap();
    assert!(again.cached);
    assert!(!again.refreshing);
    assert_eq!(backend.list_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_send_keeps_history_visible() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 12);
    let engine = signed_in(&backend).await;
    engine.refresh_conversation(&bob()).await.unwrap();

    backend.set_offline(true);
    engine
        .send(&bob(), None, Some("on its way".into()), SendMode::Standard)
        .await
        .unwrap();

    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 10);
    assert!(window.last().is_some_and(Message::is_optimistic));
    assert_eq!(ids(&window).first().map(String::as_str), Some("4"));
}

#[tokio::test]
async fn load_older_extends_the_window() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 30);
    let engine = signed_in(&backend).await;
    engine.refresh_conversation(&bob()).await.unwrap();
    assert_eq!(engine.window(&bob()).unwrap().len(), 10);

    let added = engine.load_older(&bob()).await.unwrap();
    assert_eq!(added, 10);
    let window = engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 20);
    assert_eq!(window[0].id, Some(MessageId::new("11")));
}

#[tokio::test]
async fn failed_refresh_keeps_cached_window() {
    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, 3);
    let engine = signed_in(&backend).await;
    engine.refresh_conversation(&bob()).await.unwrap();

    backend.set_offline(true);
    assert!(engine.refresh_conversation(&bob()).await.is_err());
    assert_eq!(ids(&engine.window(&bob()).unwrap()), ["1", "2", "3"]);
}
