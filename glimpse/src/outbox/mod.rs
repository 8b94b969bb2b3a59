//! Optimistic send queue.
//!
//! [`SendQueue::enqueue`] shows a placeholder immediately and hands the
//! real work to a single background worker (see [`worker`]) that uploads,
//! sends, and swaps the placeholder for the server's record. Failed sends
//! are retried with backoff and finally left visible as failed.

mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use glimpse_proto::codec::{self, CodecError};
use glimpse_proto::message::{MediaRef, Message, MessageId, UserId, ValidationError};

use crate::backend::{LocalMedia, MediaPipeline, MessageBackend};
use crate::bus::{EventBus, SyncEvent};
use crate::cache::{CacheStore, CacheValue, messages_key};
use crate::config::OutboxConfig;
use crate::lifecycle::AppState;
use crate::merge;
use crate::storage::{DurableStore, StorageError};

pub use worker::backoff_delay;

/// Durable key holding the queue snapshot.
pub const OUTBOX_KEY: &str = "glimpse.outbox.v1";

const SNAPSHOT_VERSION: u8 = 1;

/// Errors from the send queue.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message failed local validation; nothing was queued.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No send with this temp id is known.
    #[error("unknown pending send: {0}")]
    UnknownSend(MessageId),

    /// The send is not in a state that allows the operation.
    #[error("send {temp_id} is {state:?}")]
    InvalidState {
        /// Temp id of the send.
        temp_id: MessageId,
        /// Its current state.
        state: SendState,
    },

    /// The queue snapshot could not be read or written.
    #[error("outbox storage error: {0}")]
    Storage(#[from] StorageError),

    /// The queue snapshot is corrupt.
    #[error("outbox codec error: {0}")]
    Codec(#[from] CodecError),

    /// The owning session ended.
    #[error("send queue is shut down")]
    ShutDown,
}

/// Lifecycle of a pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendState {
    /// Waiting for the worker (possibly in backoff).
    Queued,
    /// Media upload in progress.
    Uploading,
    /// Message creation in progress.
    Sending,
    /// Confirmed by the server.
    Sent,
    /// Gave up; the placeholder stays visible as failed.
    Failed,
}

impl SendState {
    /// Whether the worker is currently working on the send.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Uploading | Self::Sending)
    }
}

/// How the recipient may view the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendMode {
    /// Ordinary message.
    #[default]
    Standard,
    /// Viewable once.
    ViewOnce,
    /// Sensitive; viewable once.
    Nsfw,
}

/// One outbound message owned by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    /// Identity of the placeholder.
    pub temp_id: MessageId,
    /// Recipient.
    pub peer_id: UserId,
    /// Media still to upload.
    pub local_media: Option<LocalMedia>,
    /// Upload result, kept so a retry does not upload again.
    pub uploaded: Option<MediaRef>,
    /// Caption text.
    pub caption: Option<String>,
    /// Viewing mode.
    pub mode: SendMode,
    /// Failed attempts so far.
    pub retries: u32,
    /// Current state.
    pub state: SendState,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// The placeholder shown in the conversation.
    pub placeholder: Message,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<MessageId, PendingSend>,
    /// Queued temp ids in FIFO order; in-flight and failed items are absent.
    order: VecDeque<MessageId>,
    /// Earliest retry time for items in backoff.
    ready_at: HashMap<MessageId, Instant>,
    worker_running: bool,
    paused: bool,
}

/// Durable FIFO of outbound messages for one signed-in user.
pub struct SendQueue<B: MessageBackend, M: MediaPipeline, S: DurableStore> {
    owner: UserId,
    config: OutboxConfig,
    backend: Arc<B>,
    media: Arc<M>,
    cache: Arc<CacheStore<S>>,
    store: Arc<S>,
    bus: EventBus,
    state: Mutex<QueueState>,
    wake: Notify,
    live: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
    me: Weak<Self>,
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> std::fmt::Debug for SendQueue<B, M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("owner", &self.owner)
            .field("len", &self.len())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> SendQueue<B, M, S> {
    /// Create a queue sending as `owner`.
    #[must_use]
    pub fn new(
        owner: UserId,
        config: OutboxConfig,
        backend: Arc<B>,
        media: Arc<M>,
        cache: Arc<CacheStore<S>>,
        store: Arc<S>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            owner,
            config,
            backend,
            media,
            cache,
            store,
            bus,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            live: AtomicBool::new(true),
            write_lock: tokio::sync::Mutex::new(()),
            me: me.clone(),
        })
    }

    /// The sending user.
    #[must_use]
    pub const fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Whether the owning session is still active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Queue a message to `peer`.
    ///
    /// The placeholder is merged into the conversation cache and announced
    /// with `OptimisticAdded` before this returns; the network work happens
    /// on the worker.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Validation`] if the message has no content or
    /// an oversized caption, and [`SendError::ShutDown`] after
    /// [`shutdown`](Self::shutdown).
    pub async fn enqueue(
        &self,
        peer: &UserId,
        local_media: Option<LocalMedia>,
        caption: Option<String>,
        mode: SendMode,
    ) -> Result<MessageId, SendError> {
        if !self.is_live() {
            return Err(SendError::ShutDown);
        }
        let temp_id = MessageId::temp();
        let mut placeholder =
            Message::optimistic(temp_id.clone(), &self.owner, peer, self.cache.now());
        placeholder.caption = caption.filter(|c| !c.is_empty());
        placeholder.media = local_media.as_ref().map(|local| MediaRef {
            url: local.uri.clone(),
            thumbnail_url: None,
            kind: local.kind,
        });
        placeholder = match mode {
            SendMode::Standard => placeholder,
            SendMode::ViewOnce => placeholder.view_once(),
            SendMode::Nsfw => placeholder.nsfw(),
        };
        placeholder.validate()?;

        let item = PendingSend {
            temp_id: temp_id.clone(),
            peer_id: peer.clone(),
            local_media,
            uploaded: None,
            caption: placeholder.caption.clone(),
            mode,
            retries: 0,
            state: SendState::Queued,
            last_error: None,
            placeholder: placeholder.clone(),
        };
        {
            let mut state = self.state.lock();
            state.items.insert(temp_id.clone(), item);
            state.order.push_back(temp_id.clone());
        }
        self.show_placeholder(&placeholder);
        tracing::debug!(temp_id = %temp_id, peer = %peer, "message queued");
        self.bus.emit(SyncEvent::OptimisticAdded {
            message: placeholder,
        });
        self.emit_status(&temp_id, SendState::Queued, 0, None);

        self.persist_logged().await;
        self.kick();
        Ok(temp_id)
    }

    /// Put a failed send back at the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::UnknownSend`] or [`SendError::InvalidState`] if
    /// the send is not known or not failed.
    pub async fn retry(&self, temp_id: &MessageId) -> Result<(), SendError> {
        let placeholder = {
            let mut state = self.state.lock();
            let item = state
                .items
                .get_mut(temp_id)
                .ok_or_else(|| SendError::UnknownSend(temp_id.clone()))?;
            if item.state != SendState::Failed {
                return Err(SendError::InvalidState {
                    temp_id: temp_id.clone(),
                    state: item.state,
                });
            }
            item.state = SendState::Queued;
            item.retries = 0;
            item.last_error = None;
            item.placeholder.flags.failed = false;
            item.placeholder.flags.sending = true;
            let placeholder = item.placeholder.clone();
            state.order.push_back(temp_id.clone());
            state.ready_at.remove(temp_id);
            placeholder
        };
        self.show_placeholder(&placeholder);
        tracing::debug!(temp_id = %temp_id, "failed send requeued");
        self.emit_status(temp_id, SendState::Queued, 0, None);
        self.persist_logged().await;
        self.kick();
        Ok(())
    }

    /// Drop a queued or failed send and its placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::UnknownSend`] if the send is not known and
    /// [`SendError::InvalidState`] while it is in flight.
    pub async fn cancel(&self, temp_id: &MessageId) -> Result<(), SendError> {
        let item = {
            let mut state = self.state.lock();
            let current = state
                .items
                .get(temp_id)
                .map(|item| item.state)
                .ok_or_else(|| SendError::UnknownSend(temp_id.clone()))?;
            if current.is_in_flight() {
                return Err(SendError::InvalidState {
                    temp_id: temp_id.clone(),
                    state: current,
                });
            }
            state.order.retain(|id| id != temp_id);
            state.ready_at.remove(temp_id);
            state.items.remove(temp_id)
        };
        if let Some(item) = item {
            let key = messages_key(&self.owner, &item.peer_id);
            self.cache.update(&key, |value| {
                if let CacheValue::Messages(list) = value {
                    list.retain(|m| !(m.is_optimistic() && m.has_identity(temp_id)));
                }
            });
            tracing::debug!(temp_id = %temp_id, "pending send cancelled");
            self.bus.emit(SyncEvent::MessageDeleted {
                id: temp_id.clone(),
            });
        }
        self.persist_logged().await;
        Ok(())
    }

    /// Placeholders of unfinished sends to `peer`, oldest first.
    ///
    /// Failed sends are excluded; their placeholders live on in the cache.
    #[must_use]
    pub fn pending_for(&self, peer: &UserId) -> Vec<Message> {
        let state = self.state.lock();
        let mut list: Vec<Message> = state
            .items
            .values()
            .filter(|item| item.peer_id == *peer && item.state != SendState::Failed)
            .map(|item| item.placeholder.clone())
            .collect();
        list.sort_by_key(|m| m.created_at);
        list
    }

    /// Copy of one send.
    #[must_use]
    pub fn get(&self, temp_id: &MessageId) -> Option<PendingSend> {
        self.state.lock().items.get(temp_id).cloned()
    }

    /// Number of sends the queue still owns, failed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue owns no sends.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Load a persisted queue and resume sending.
    ///
    /// Sends interrupted mid-flight are queued again. Returns how many
    /// sends were restored.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Storage`] or [`SendError::Codec`] if the
    /// snapshot cannot be read.
    pub async fn restore(&self) -> Result<usize, SendError> {
        let Some(bytes) = self.store.get(OUTBOX_KEY).await? else {
            return Ok(0);
        };
        let items: Vec<PendingSend> = codec::decode_snapshot(SNAPSHOT_VERSION, &bytes)?;
        let mut restored = Vec::new();
        {
            let mut state = self.state.lock();
            for mut item in items {
                if item.placeholder.sender_id != self.owner
                    || state.items.contains_key(&item.temp_id)
                {
                    continue;
                }
                if item.state != SendState::Failed {
                    item.state = SendState::Queued;
                    state.order.push_back(item.temp_id.clone());
                }
                restored.push(item.placeholder.clone());
                state.items.insert(item.temp_id.clone(), item);
            }
        }
        for placeholder in &restored {
            self.show_placeholder(placeholder);
        }
        tracing::info!(count = restored.len(), "outbox restored");
        self.kick();
        Ok(restored.len())
    }

    /// Write the queue to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Storage`] or [`SendError::Codec`] on failure.
    pub async fn persist(&self) -> Result<(), SendError> {
        let _guard = self.write_lock.lock().await;
        let snapshot: Vec<PendingSend> = {
            let state = self.state.lock();
            let mut items: Vec<PendingSend> = state.items.values().cloned().collect();
            items.sort_by_key(|item| item.placeholder.created_at);
            items
        };
        if snapshot.is_empty() {
            self.store.remove(OUTBOX_KEY).await?;
        } else {
            let bytes = codec::encode_snapshot(SNAPSHOT_VERSION, &snapshot)?;
            self.store.set(OUTBOX_KEY, bytes).await?;
        }
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "failed to persist outbox");
        }
    }

    /// Stop taking new work (app went to background).
    pub fn pause(&self) {
        self.state.lock().paused = true;
        self.wake.notify_one();
    }

    /// Resume the worker if anything is queued (app returned to foreground).
    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.kick();
    }

    /// Pause and resume with the app lifecycle until the channel closes.
    #[must_use]
    pub fn watch_lifecycle(&self, mut rx: watch::Receiver<AppState>) -> JoinHandle<()> {
        let queue = self.me.clone();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                match state {
                    AppState::Background => queue.pause(),
                    AppState::Foreground => queue.resume(),
                }
                drop(queue);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// End the session: the worker stops and in-flight results are
    /// discarded. Persisted sends are left for the next session.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.order.clear();
        state.ready_at.clear();
        state.items.clear();
        drop(state);
        self.wake.notify_one();
    }

    fn show_placeholder(&self, placeholder: &Message) {
        let key = messages_key(&self.owner, &placeholder.receiver_id);
        let merged = self.cache.update(&key, |value| {
            if let CacheValue::Messages(list) = value {
                merge::merge_into(list, [placeholder.clone()]);
            }
        });
        if merged.is_none() {
            self.cache
                .set(&key, CacheValue::Messages(vec![placeholder.clone()]));
        }
    }

    fn emit_status(
        &self,
        temp_id: &MessageId,
        state: SendState,
        retries: u32,
        error: Option<String>,
    ) {
        self.bus.emit(SyncEvent::SendStatusChanged {
            temp_id: temp_id.clone(),
            state,
            retries,
            error,
        });
    }
}
