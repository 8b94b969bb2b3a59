//! Integration tests for view-once and NSFW content.
//!
//! Verifies:
//! 1. A consumed ephemeral message leaves every window and never comes back,
//!    not after a fresh fetch and not after a restart.
//! 2. Consuming a received message reports the read to the server, and it
//!    stops being a conversation's last message even in a fresh list.
//! 3. Viewing time does not advance while the app is backgrounded.
//! 4. Closing the viewer early only consumes when asked to.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use glimpse::bus::{EventKind, SyncEvent};
use glimpse::cache::conversations_key;
use glimpse::config::SyncConfig;
use glimpse::engine::SyncEngine;
use glimpse::ephemeral::StartOutcome;
use glimpse::lifecycle::{AppState, Lifecycle};
use glimpse::loopback::LoopbackBackend;
use glimpse::storage::MemoryStore;
use glimpse_proto::message::{MediaKind, MediaRef, Message, MessageId, Timestamp, UserId};

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

fn photo(id: &str, ts: u64) -> Message {
    Message::authoritative(id, &bob(), &alice(), Timestamp::from_millis(ts)).with_media(MediaRef {
        url: format!("loopback://media/{id}.jpg"),
        thumbnail_url: None,
        kind: MediaKind::Image,
    })
}

fn clip(id: &str, ts: u64) -> Message {
    Message::authoritative(id, &bob(), &alice(), Timestamp::from_millis(ts)).with_media(MediaRef {
        url: format!("loopback://media/{id}.mp4"),
        thumbnail_url: None,
        kind: MediaKind::Video,
    })
}

fn text(id: &str, ts: u64) -> Message {
    Message::authoritative(id, &bob(), &alice(), Timestamp::from_millis(ts)).with_caption("hey")
}

async fn signed_in(backend: &Arc<LoopbackBackend>, store: &Arc<MemoryStore>) -> Engine {
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Arc::clone(backend),
        Arc::clone(backend),
        Arc::clone(store),
        Arc::new(Lifecycle::new()),
    );
    engine.initialize(alice()).await.unwrap();
    engine
}

fn visible(engine: &Engine, id: &str) -> bool {
    let id = MessageId::new(id);
    engine
        .window(&bob())
        .unwrap()
        .iter()
        .any(|m| m.has_identity(&id))
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
async fn viewed_nsfw_message_is_never_projected_again() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(photo("m1", 10).nsfw());
    backend.seed(text("m2", 20));

    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();
    assert!(visible(&engine, "m1"));

    let viewed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&viewed);
    let _sub = engine.subscribe(EventKind::MessageViewed, move |e| sink.lock().push(e.clone()));

    let m1 = photo("m1", 10).nsfw();
    assert_eq!(engine.view(&m1, None).unwrap(), StartOutcome::Started);
    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    assert!(!visible(&engine, "m1"));
    assert!(visible(&engine, "m2"));
    assert_eq!(
        viewed.lock().as_slice(),
        [SyncEvent::MessageViewed {
            message_id: MessageId::new("m1")
        }]
    );
    assert!(backend.read_log().contains(&(MessageId::new("m1"), alice())));
    assert_eq!(engine.view(&m1, None).unwrap(), StartOutcome::AlreadyViewed);

    // The server still has it; a fresh fetch must not resurrect it.
    engine.refresh_conversation(&bob()).await.unwrap();
    assert!(!visible(&engine, "m1"));

    engine.teardown().await;
    let restarted = signed_in(&backend, &store).await;
    restarted.refresh_conversation(&bob()).await.unwrap();
    assert!(!visible(&restarted, "m1"));
    assert!(visible(&restarted, "m2"));
}

#[tokio::test(start_paused = true)]
async fn viewed_message_leaves_the_conversation_list() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(text("m0", 10));
    backend.seed(photo("m1", 20).nsfw());

    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();
    let before = engine.conversations().await.unwrap();
    assert_eq!(before[0].last_message.as_ref().unwrap().id, Some(MessageId::new("m1")));

    engine.view(&photo("m1", 20).nsfw(), None).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    let cached = engine.conversations().await.unwrap();
    assert_eq!(cached[0].last_message.as_ref().unwrap().id, Some(MessageId::new("m0")));

    // The server still reports m1 as the latest message.
    engine.cache().remove(&conversations_key(&alice()));
    let fetched = engine.conversations().await.unwrap();
    let last = fetched[0].last_message.as_ref().unwrap();
    assert_eq!(last.id, Some(MessageId::new("m0")));
    assert_eq!(fetched[0].last_message_time, Some(Timestamp::from_millis(10)));
}

#[tokio::test(start_paused = true)]
async fn unviewed_ephemeral_messages_are_not_marked_read_in_bulk() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(photo("m1", 10).view_once());
    backend.seed(text("m2", 20));

    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();
    let reported = engine.mark_conversation_read(&bob()).await.unwrap();

    assert_eq!(reported, 1);
    assert_eq!(backend.read_log(), vec![(MessageId::new("m2"), alice())]);
    assert!(visible(&engine, "m1"));
}

#[tokio::test(start_paused = true)]
async fn background_pauses_viewing() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(photo("m1", 10).view_once());
    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();

    let m1 = photo("m1", 10).view_once();
    engine.view(&m1, None).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.set_app_state(AppState::Background);
    settle().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert!(visible(&engine, "m1"));
    let progress = engine.viewing_progress(&MessageId::new("m1")).unwrap();
    assert!(progress.is_some_and(|p| (p - 0.4).abs() < 1e-6));

    engine.set_app_state(AppState::Foreground);
    settle().await;
    tokio::time::sleep(Duration::from_millis(3_100)).await;
    settle().await;
    assert!(!visible(&engine, "m1"));
}

#[tokio::test(start_paused = true)]
async fn video_is_consumed_when_playback_ends() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(clip("v1", 10).nsfw());
    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();

    let v1 = clip("v1", 10).nsfw();
    let id = MessageId::new("v1");
    engine.view(&v1, None).unwrap();
    assert!(engine.set_media_duration(&id, Duration::from_secs(30)).unwrap());
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(visible(&engine, "v1"));

    assert!(engine.playback_ended(&id).await.unwrap());
    settle().await;
    assert!(!visible(&engine, "v1"));
    assert!(engine.viewed().contains(&id));
}

#[tokio::test(start_paused = true)]
async fn closing_early_consumes_only_when_asked() {
    let backend = Arc::new(LoopbackBackend::new());
    let store = Arc::new(MemoryStore::new());
    backend.seed(photo("m1", 10).view_once());
    backend.seed(photo("m2", 20).view_once());
    let engine = signed_in(&backend, &store).await;
    engine.refresh_conversation(&bob()).await.unwrap();

    engine.view(&photo("m1", 10).view_once(), None).unwrap();
    assert!(engine.stop_viewing(&MessageId::new("m1"), false).await.unwrap());
    engine.view(&photo("m2", 20).view_once(), None).unwrap();
    assert!(engine.stop_viewing(&MessageId::new("m2"), true).await.unwrap());
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    assert!(visible(&engine, "m1"));
    assert!(!visible(&engine, "m2"));
}
