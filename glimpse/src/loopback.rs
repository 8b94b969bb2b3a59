//! Loopback backend for testing.
//!
//! [`LoopbackBackend`] keeps messages in process memory and implements both
//! [`MessageBackend`] and [`MediaPipeline`]. Every mutation is published on
//! the realtime feed the same way a hosted backend would, including the
//! echoed client temp id on inserts. Connectivity can be toggled with
//! [`set_offline`](LoopbackBackend::set_offline), individual calls can be
//! made to fail with [`fail_next`](LoopbackBackend::fail_next), and the temp
//! id echo can be switched off with
//! [`set_echo_temp_ids`](LoopbackBackend::set_echo_temp_ids).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use glimpse_proto::event::RealtimeEvent;
use glimpse_proto::message::{MediaRef, Message, MessageId, Timestamp, UserId};
use glimpse_proto::projection::ConversationProjection;

use crate::backend::{BackendError, ListQuery, LocalMedia, MediaPipeline, MessageBackend, Order};

/// In-process backend and media pipeline.
#[derive(Debug, Default)]
pub struct LoopbackBackend {
    /// All stored messages, in insertion order.
    messages: Mutex<Vec<Message>>,
    /// Open realtime feeds.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RealtimeEvent>>>,
    /// Every call fails with `Offline` while set.
    offline: AtomicBool,
    /// Created records lose their client temp id while set.
    strip_temp_ids: AtomicBool,
    /// Creation time stamped on created records instead of the draft's.
    server_time: Mutex<Option<Timestamp>>,
    /// Number of upcoming calls that fail with `Unavailable`.
    fail_budget: AtomicU32,
    /// Artificial latency applied to reads.
    latency: Mutex<Option<Duration>>,
    /// Next server id.
    next_id: AtomicU64,
    /// Calls to `list_messages`.
    list_calls: AtomicUsize,
    /// Calls to `list_conversations`.
    conversation_calls: AtomicUsize,
    /// Attempts of `create_message`, including failed ones.
    create_attempts: AtomicUsize,
    /// Successful `mark_read` calls.
    read_log: Mutex<Vec<(MessageId, UserId)>>,
}

impl LoopbackBackend {
    /// Create an empty, online backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Toggle connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether created records keep the client temp id.
    pub fn set_echo_temp_ids(&self, echo: bool) {
        self.strip_temp_ids.store(!echo, Ordering::SeqCst);
    }

    /// Stamp created records with `at` instead of the draft's time.
    pub fn set_server_time(&self, at: Option<Timestamp>) {
        *self.server_time.lock() = at;
    }

    /// Make the next `n` calls fail with [`BackendError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Delay every read by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Store a message without publishing a notification.
    pub fn seed(&self, msg: Message) {
        self.messages.lock().push(msg);
    }

    /// Store a message written by another client and publish its insert.
    pub fn insert_remote(&self, msg: Message) {
        self.messages.lock().push(msg.clone());
        self.publish(RealtimeEvent::insert(&msg));
    }

    /// Delete a message and publish the delete notification.
    ///
    /// Returns `false` if no message has that id.
    pub fn delete_remote(&self, id: &MessageId) -> bool {
        let removed = {
            let mut messages = self.messages.lock();
            messages
                .iter()
                .position(|m| m.id.as_ref() == Some(id))
                .map(|pos| messages.remove(pos))
        };
        removed.is_some_and(|old| {
            self.publish(RealtimeEvent::delete(&old));
            true
        })
    }

    /// Push a raw notification to every open feed.
    pub fn publish(&self, event: RealtimeEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Snapshot of all stored messages.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Successful `mark_read` calls so far.
    #[must_use]
    pub fn read_log(&self) -> Vec<(MessageId, UserId)> {
        self.read_log.lock().clone()
    }

    /// Number of `list_messages` calls so far.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `list_conversations` calls so far.
    #[must_use]
    pub fn conversation_calls(&self) -> usize {
        self.conversation_calls.load(Ordering::SeqCst)
    }

    /// Number of `create_message` attempts so far.
    #[must_use]
    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    /// Number of open realtime feeds.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Offline);
        }
        let consumed = self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MessageBackend for LoopbackBackend {
    async fn list_messages(
        &self,
        a: &UserId,
        b: &UserId,
        query: ListQuery,
    ) -> Result<Vec<Message>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;

        let mut rows: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .filter(|m| m.involves(a, b))
            .filter(|m| query.before.is_none_or(|t| m.created_at < t))
            .filter(|m| query.after.is_none_or(|t| m.created_at > t))
            .cloned()
            .collect();
        rows.sort_by(|x, y| y.created_at.cmp(&x.created_at));
        rows.truncate(query.limit);
        if query.order == Order::Ascending {
            rows.reverse();
        }
        Ok(rows)
    }

    async fn create_message(&self, draft: &Message) -> Result<Message, BackendError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        draft
            .validate()
            .map_err(|e| BackendError::Rejected(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut created = draft.clone();
        created.id = Some(MessageId::new(id.to_string()));
        created.flags.sending = false;
        created.flags.failed = false;
        created.flags.seen = false;
        if self.strip_temp_ids.load(Ordering::SeqCst) {
            created.temp_id = None;
        }
        if let Some(at) = *self.server_time.lock() {
            created.created_at = at;
        }

        self.messages.lock().push(created.clone());
        self.publish(RealtimeEvent::insert(&created));
        Ok(created)
    }

    async fn mark_read(&self, id: &MessageId, reader: &UserId) -> Result<(), BackendError> {
        self.check_available()?;
        let change = {
            let mut messages = self.messages.lock();
            let Some(msg) = messages.iter_mut().find(|m| m.id.as_ref() == Some(id)) else {
                return Err(BackendError::NotFound(id.to_string()));
            };
            if msg.receiver_id != *reader {
                return Err(BackendError::Rejected(format!(
                    "{reader} is not the receiver of {id}"
                )));
            }
            if msg.flags.seen {
                None
            } else {
                let old = msg.clone();
                msg.flags.seen = true;
                Some((old, msg.clone()))
            }
        };
        self.read_log.lock().push((id.clone(), reader.clone()));
        if let Some((old, new)) = change {
            self.publish(RealtimeEvent::update(&old, &new));
        }
        Ok(())
    }

    async fn list_conversations(
        &self,
        owner: &UserId,
    ) -> Result<Vec<ConversationProjection>, BackendError> {
        self.conversation_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_available()?;

        let messages = self.messages.lock().clone();
        let mut by_peer: BTreeMap<UserId, ConversationProjection> = BTreeMap::new();
        for msg in &messages {
            let Some(peer) = msg.peer_of(owner) else {
                continue;
            };
            let entry = by_peer
                .entry(peer.clone())
                .or_insert_with(|| ConversationProjection::new(owner, peer));
            if msg.receiver_id == *owner && !msg.flags.seen {
                entry.unread_count += 1;
            }
            if entry.is_newer(msg) {
                entry.last_message_time = Some(msg.created_at);
                entry.last_message = Some(msg.clone());
            }
        }

        let mut list: Vec<ConversationProjection> = by_peer
            .into_values()
            .map(|mut p| {
                let owner_sent = p.owner_sent_last();
                let last_seen = p.last_message.as_ref().is_some_and(|m| m.flags.seen);
                p.seen = owner_sent && last_seen;
                p.has_new_message = !owner_sent && p.unread_count > 0;
                p
            })
            .collect();
        list.sort_by(|x, y| y.last_message_time.cmp(&x.last_message_time));
        Ok(list)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RealtimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl MediaPipeline for LoopbackBackend {
    async fn upload(&self, media: &LocalMedia) -> Result<MediaRef, BackendError> {
        self.check_available()?;
        let name = media
            .uri
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("upload");
        Ok(MediaRef {
            url: format!("loopback://media/{name}"),
            thumbnail_url: Some(format!("loopback://thumbs/{name}")),
            kind: media.kind,
        })
    }
}
