//! Integration tests for realtime reconciliation.
//!
//! Two engines share one loopback backend, standing in for the two ends of
//! a conversation. Verifies:
//! 1. Remote inserts reach open windows and the receiver is notified.
//! 2. Read receipts are directional: the sender sees `seen`, the receiver
//!    loses its unread badge, and neither side is touched the other way.
//! 3. Deletes and bulk deletes drop cached state.

use std::sync::Arc;

use parking_lot::Mutex;

use glimpse::bus::{EventKind, Subscription, SyncEvent};
use glimpse::cache::{CacheValue, conversations_key, messages_key};
use glimpse::config::SyncConfig;
use glimpse::engine::SyncEngine;
use glimpse::lifecycle::Lifecycle;
use glimpse::loopback::LoopbackBackend;
use glimpse::storage::MemoryStore;
use glimpse_proto::event::RealtimeEvent;
use glimpse_proto::message::{Message, MessageId, Timestamp, UserId};
use glimpse_proto::projection::ConversationProjection;

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

fn text(id: &str, from: &UserId, to: &UserId, ts: u64) -> Message {
    Message::authoritative(id, from, to, Timestamp::from_millis(ts))
        .with_caption(format!("msg {id}"))
}

async fn session(backend: &Arc<LoopbackBackend>, owner: UserId) -> Engine {
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Arc::clone(backend),
        Arc::clone(backend),
        Arc::new(MemoryStore::new()),
        Arc::new(Lifecycle::new()),
    );
    engine.initialize(owner).await.unwrap();
    engine
}

fn projection(engine: &Engine, owner: &UserId, peer: &UserId) -> Option<ConversationProjection> {
    engine
        .cache()
        .peek(&conversations_key(owner))
        .and_then(CacheValue::into_conversations)?
        .into_iter()
        .find(|p| p.peer_id == *peer)
}

fn record(engine: &Engine, kind: EventKind) -> (Arc<Mutex<Vec<SyncEvent>>>, Subscription) {
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

#[tokio::test]
async fn remote_insert_reaches_window_and_notifies_receiver() {
    let backend = Arc::new(LoopbackBackend::new());
    let alice_engine = session(&backend, alice()).await;
    alice_engine.refresh_conversation(&bob()).await.unwrap();
    let (received, _sub) = record(&alice_engine, EventKind::MessageReceived);

    backend.insert_remote(text("1", &bob(), &alice(), 10));
    settle().await;

    let window = alice_engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].id, Some(MessageId::new("1")));
    assert_eq!(received.lock().len(), 1);
}

#[tokio::test]
async fn own_messages_are_not_reported_as_received() {
    let backend = Arc::new(LoopbackBackend::new());
    let alice_engine = session(&backend, alice()).await;
    alice_engine.refresh_conversation(&bob()).await.unwrap();
    let (received, _sub) = record(&alice_engine, EventKind::MessageReceived);

    backend.insert_remote(text("1", &alice(), &bob(), 10));
    settle().await;

    assert_eq!(alice_engine.window(&bob()).unwrap().len(), 1);
    assert!(received.lock().is_empty());
}

#[tokio::test]
async fn read_receipts_are_directional() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(text("1", &alice(), &bob(), 10));
    let alice_engine = session(&backend, alice()).await;
    let bob_engine = session(&backend, bob()).await;

    alice_engine.conversations().await.unwrap();
    bob_engine.conversations().await.unwrap();
    bob_engine.refresh_conversation(&alice()).await.unwrap();

    let before = projection(&bob_engine, &bob(), &alice()).unwrap();
    assert_eq!(before.unread_count, 1);
    assert!(before.has_new_message);
    let sender_before = projection(&alice_engine, &alice(), &bob()).unwrap();
    assert!(!sender_before.seen);

    let (reads, _sub) = record(&alice_engine, EventKind::ReadStatusChanged);
    let reported = bob_engine.mark_conversation_read(&alice()).await.unwrap();
    assert_eq!(reported, 1);
    settle().await;

    let sender_after = projection(&alice_engine, &alice(), &bob()).unwrap();
    assert!(sender_after.seen);
    assert!(!sender_after.has_new_message);
    assert_eq!(sender_after.unread_count, 0);

    let receiver_after = projection(&bob_engine, &bob(), &alice()).unwrap();
    assert_eq!(receiver_after.unread_count, 0);
    assert!(!receiver_after.has_new_message);
    assert!(!receiver_after.seen);

    let reads = reads.lock();
    assert!(reads.iter().any(|e| matches!(
        e,
        SyncEvent::ReadStatusChanged { seen: true, sender, receiver, .. }
            if *sender == alice() && *receiver == bob()
    )));
    assert_eq!(backend.read_log(), vec![(MessageId::new("1"), bob())]);
}

#[tokio::test]
async fn remote_delete_drops_message_and_rebuilds_last() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(text("1", &bob(), &alice(), 10));
    backend.seed(text("2", &bob(), &alice(), 20));
    let alice_engine = session(&backend, alice()).await;
    alice_engine.refresh_conversation(&bob()).await.unwrap();
    alice_engine.conversations().await.unwrap();

    assert!(backend.delete_remote(&MessageId::new("2")));
    settle().await;

    let window = alice_engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].id, Some(MessageId::new("1")));
    let last = projection(&alice_engine, &alice(), &bob())
        .and_then(|p| p.last_message)
        .and_then(|m| m.id);
    assert_eq!(last, Some(MessageId::new("1")));
}

#[tokio::test]
async fn bulk_delete_invalidates_owner_caches() {
    let backend = Arc::new(LoopbackBackend::new());
    backend.seed(text("1", &bob(), &alice(), 10));
    let alice_engine = session(&backend, alice()).await;
    alice_engine.refresh_conversation(&bob()).await.unwrap();
    alice_engine.conversations().await.unwrap();
    let (invalidated, _sub) = record(&alice_engine, EventKind::CacheInvalidated);

    backend.publish(RealtimeEvent::bulk_delete());
    settle().await;

    let cache = alice_engine.cache();
    assert!(!cache.contains(&messages_key(&alice(), &bob())));
    assert!(!cache.contains(&conversations_key(&alice())));
    assert_eq!(invalidated.lock().len(), 2);
}

#[tokio::test]
async fn malformed_rows_are_ignored() {
    let backend = Arc::new(LoopbackBackend::new());
    let alice_engine = session(&backend, alice()).await;
    alice_engine.refresh_conversation(&bob()).await.unwrap();

    let mut broken = RealtimeEvent::insert(&text("1", &bob(), &alice(), 10));
    broken.new = Some(serde_json::json!({ "id": 7, "sender_id": null }));
    backend.publish(broken);
    backend.insert_remote(text("2", &bob(), &alice(), 20));
    settle().await;

    let window = alice_engine.window(&bob()).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].id, Some(MessageId::new("2")));
}
