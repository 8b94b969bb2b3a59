//! Realtime reconciliation.
//!
//! The [`Reconciler`] consumes backend change notifications and applies each
//! one as a targeted edit of the affected cache entries: both directional
//! message windows and both participants' conversation lists. When an edit
//! has no cached target it falls back to a debounced re-fetch of that user's
//! conversation list, and failing that invalidates only that list.

pub mod classify;
pub mod projection;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use glimpse_proto::event::RealtimeEvent;
use glimpse_proto::message::{Message, MessageId, UserId};
use glimpse_proto::projection::ConversationProjection;
use glimpse_proto::row::RowField;

use crate::backend::{BackendError, MessageBackend};
use crate::bus::{EventBus, EventKind, Subscription, SyncEvent};
use crate::cache::entry::{MESSAGES_PREFIX, conversations_owner};
use crate::cache::{
    CachePattern, CacheStore, CacheValue, conversations_key, messages_key, owner_messages_prefix,
};
use crate::config::EventConfig;
use crate::debounce::Debouncer;
use crate::ephemeral::ViewedSet;
use crate::merge;
use crate::storage::DurableStore;

pub use classify::{Change, classify};
pub use projection::Edit;

/// Disposer for a running realtime subscription.
///
/// Dropping the handle stops event processing.
#[must_use = "dropping the handle stops realtime processing"]
#[derive(Debug)]
pub struct RealtimeHandle {
    task: Option<JoinHandle<()>>,
}

impl RealtimeHandle {
    /// Stop processing events.
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether events are still being processed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Applies realtime changes to the cache for one signed-in user.
pub struct Reconciler<B: MessageBackend, S: DurableStore> {
    owner: UserId,
    backend: Arc<B>,
    cache: Arc<CacheStore<S>>,
    viewed: Arc<ViewedSet<S>>,
    bus: EventBus,
    refresh: Debouncer,
    /// Peers a pending conversation refresh must produce, per user.
    wanted: Mutex<HashMap<UserId, HashSet<UserId>>>,
    live: AtomicBool,
    me: Weak<Self>,
}

impl<B: MessageBackend, S: DurableStore> std::fmt::Debug for Reconciler<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("owner", &self.owner)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

fn directions(msg: &Message) -> [(UserId, UserId); 2] {
    [
        (msg.sender_id.clone(), msg.receiver_id.clone()),
        (msg.receiver_id.clone(), msg.sender_id.clone()),
    ]
}

fn same_record(existing: &Message, incoming: &Message) -> bool {
    [&incoming.id, &incoming.temp_id]
        .into_iter()
        .flatten()
        .any(|id| existing.has_identity(id))
}

/// Patch `list` with an updated row, or merge it in if absent.
///
/// Columns present in the new image win. `seen` only goes from true to
/// false when the update changed it explicitly.
fn patch_window(list: &mut Vec<Message>, msg: &Message, changed: &[RowField]) {
    let Some(existing) = list.iter_mut().find(|m| same_record(m, msg)) else {
        merge::merge_into(list, [msg.clone()]);
        return;
    };
    existing.flags.seen = if changed.contains(&RowField::Seen) {
        msg.flags.seen
    } else {
        existing.flags.seen || msg.flags.seen
    };
    if changed.contains(&RowField::Caption) || msg.caption.is_some() {
        existing.caption.clone_from(&msg.caption);
    }
    if changed.contains(&RowField::Media) || msg.media.is_some() {
        existing.media.clone_from(&msg.media);
    }
    if changed.contains(&RowField::Ephemeral) {
        existing.flags.view_once = msg.flags.view_once;
        existing.flags.is_nsfw = msg.flags.is_nsfw;
    }
    if existing.id.is_none() && msg.id.is_some() {
        existing.id.clone_from(&msg.id);
        existing.flags.sending = false;
        existing.flags.failed = false;
    }
}

impl<B: MessageBackend, S: DurableStore> Reconciler<B, S> {
    /// Create a reconciler for `owner`'s session.
    #[must_use]
    pub fn new(
        owner: UserId,
        backend: Arc<B>,
        cache: Arc<CacheStore<S>>,
        viewed: Arc<ViewedSet<S>>,
        bus: EventBus,
        config: &EventConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            owner,
            backend,
            cache,
            viewed,
            bus,
            refresh: Debouncer::new(config.refresh_debounce),
            wanted: Mutex::new(HashMap::new()),
            live: AtomicBool::new(true),
            me: me.clone(),
        })
    }

    /// The signed-in user.
    #[must_use]
    pub const fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Whether the owning session is still active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// End the session: pending refreshes are dropped and late results
    /// are discarded.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.refresh.cancel_all();
        self.wanted.lock().clear();
    }

    /// Process notifications from `events` until the stream closes or the
    /// handle is dropped.
    pub fn start(&self, mut events: mpsc::UnboundedReceiver<RealtimeEvent>) -> RealtimeHandle {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(reconciler) = me.upgrade() else {
                    break;
                };
                if !reconciler.is_live() {
                    break;
                }
                reconciler.handle(&event);
            }
            tracing::debug!("realtime stream ended");
        });
        RealtimeHandle { task: Some(task) }
    }

    /// Classify and apply one notification. Malformed notifications are
    /// dropped.
    pub fn handle(&self, event: &RealtimeEvent) -> Option<Change> {
        match classify(event) {
            Ok(change) => {
                self.apply(change.clone());
                Some(change)
            }
            Err(e) => {
                tracing::debug!(
                    kind = %event.event_type,
                    error = %e,
                    "dropping malformed notification"
                );
                None
            }
        }
    }

    /// Apply a classified change.
    pub fn apply(&self, change: Change) {
        match change {
            Change::Insert(msg) => self.apply_insert(msg),
            Change::Update { message, changed } => self.apply_update(message, &changed),
            Change::Delete { ids, participants } => self.apply_delete(&ids, participants.as_ref()),
            Change::BulkDelete => self.apply_bulk_delete(),
        }
    }

    fn apply_insert(&self, msg: Message) {
        for (owner, peer) in directions(&msg) {
            self.cache.update(&messages_key(&owner, &peer), |value| {
                if let CacheValue::Messages(list) = value {
                    merge::merge_into(list, [msg.clone()]);
                }
            });
            let edit = self.cache.update(&conversations_key(&owner), |value| match value {
                CacheValue::Conversations(list) => projection::apply_insert(list, &owner, &msg),
                CacheValue::Messages(_) => Edit::Unchanged,
            });
            if edit.is_some_and(Edit::changed) {
                self.bus.emit(SyncEvent::ConversationUpdated { owner, peer });
            }
        }
        tracing::debug!(id = ?msg.id, sender = %msg.sender_id, "insert applied");
        if msg.receiver_id == self.owner {
            self.bus.emit(SyncEvent::MessageReceived { message: msg });
        }
    }

    fn apply_update(&self, msg: Message, changed: &[RowField]) {
        for (owner, peer) in directions(&msg) {
            self.cache.update(&messages_key(&owner, &peer), |value| {
                if let CacheValue::Messages(list) = value {
                    patch_window(list, &msg, changed);
                }
            });
        }

        if changed.contains(&RowField::Seen) {
            for (owner, peer) in directions(&msg) {
                let edit = self.cache.update(&conversations_key(&owner), |value| match value {
                    CacheValue::Conversations(list) => projection::apply_read(list, &owner, &msg),
                    CacheValue::Messages(_) => Edit::Unchanged,
                });
                match edit {
                    Some(Edit::Applied) => {
                        self.bus.emit(SyncEvent::ConversationUpdated { owner, peer });
                    }
                    Some(Edit::Missing) => self.schedule_refresh(&owner, Some(peer)),
                    Some(Edit::Unchanged) | None => {}
                }
            }
            if let Some(id) = msg.identity() {
                self.bus.emit(SyncEvent::ReadStatusChanged {
                    message_id: id.clone(),
                    sender: msg.sender_id.clone(),
                    receiver: msg.receiver_id.clone(),
                    seen: msg.flags.seen,
                });
            }
        }

        tracing::debug!(id = ?msg.id, ?changed, "update applied");
        self.bus.emit(SyncEvent::MessageUpdated {
            message: msg,
            changed: changed.to_vec(),
        });
    }

    fn apply_delete(&self, ids: &[MessageId], participants: Option<&(UserId, UserId)>) {
        let in_scope = |key: &str| {
            participants.is_none_or(|(a, b)| key == messages_key(a, b) || key == messages_key(b, a))
        };
        let keys = self.cache.keys();
        for key in keys
            .iter()
            .filter(|k| k.starts_with(MESSAGES_PREFIX) && in_scope(k))
        {
            self.cache.update(key, |value| {
                if let CacheValue::Messages(list) = value {
                    for id in ids {
                        merge::remove_identity(list, id);
                    }
                }
            });
        }

        for owner in keys.iter().filter_map(|k| conversations_owner(k)) {
            for id in ids {
                self.rebuild_last(&owner, id);
            }
        }

        if let Some(id) = ids.first() {
            tracing::debug!(%id, "delete applied");
            self.bus.emit(SyncEvent::MessageDeleted { id: id.clone() });
        }
    }

    /// Recompute `owner`'s entries whose last message was `removed`.
    fn rebuild_last(&self, owner: &UserId, removed: &MessageId) {
        let Some(list) = self
            .cache
            .peek(&conversations_key(owner))
            .and_then(CacheValue::into_conversations)
        else {
            return;
        };
        for peer in projection::peers_with_last(&list, removed) {
            let window = self
                .cache
                .peek(&messages_key(owner, &peer))
                .and_then(CacheValue::into_messages);
            let edit = self.cache.update(&conversations_key(owner), |value| match value {
                CacheValue::Conversations(list) => {
                    projection::replace_removed(list, &peer, removed, window.as_deref())
                }
                CacheValue::Messages(_) => Edit::Unchanged,
            });
            match edit {
                Some(Edit::Applied) => self.bus.emit(SyncEvent::ConversationUpdated {
                    owner: owner.clone(),
                    peer,
                }),
                Some(Edit::Missing) => self.schedule_refresh(owner, None),
                Some(Edit::Unchanged) | None => {}
            }
        }
    }

    fn apply_bulk_delete(&self) {
        tracing::warn!(owner = %self.owner, "bulk delete received, clearing account caches");
        let patterns = [
            CachePattern::Prefix(owner_messages_prefix(&self.owner)),
            CachePattern::Exact(conversations_key(&self.owner)),
        ];
        for pattern in patterns {
            self.cache.invalidate(&pattern);
            self.bus.emit(SyncEvent::CacheInvalidated {
                pattern: pattern.to_string(),
            });
        }
    }

    fn invalidate_conversations(&self, user: &UserId) {
        let pattern = CachePattern::Exact(conversations_key(user));
        self.cache.invalidate(&pattern);
        self.bus.emit(SyncEvent::CacheInvalidated {
            pattern: pattern.to_string(),
        });
    }

    /// Re-fetch `user`'s conversation list after a quiet period. Requests
    /// for the same user coalesce.
    fn schedule_refresh(&self, user: &UserId, peer: Option<UserId>) {
        if let Some(peer) = peer {
            self.wanted
                .lock()
                .entry(user.clone())
                .or_default()
                .insert(peer);
        }
        let me = self.me.clone();
        let target = user.clone();
        let scheduled = self.refresh.schedule(conversations_key(user), async move {
            if let Some(reconciler) = me.upgrade() {
                // Failures are logged and already fell back to invalidation.
                let _ = reconciler.refresh_conversations(&target).await;
            }
        });
        if !scheduled {
            self.wanted.lock().remove(user);
            self.invalidate_conversations(user);
        }
    }

    /// Re-derive `user`'s conversation list from the backend.
    ///
    /// If the fetch fails, or a peer an earlier edit was looking for is
    /// still missing, only that user's list is invalidated.
    ///
    /// # Errors
    ///
    /// Returns the backend error after invalidating.
    pub async fn refresh_conversations(&self, user: &UserId) -> Result<(), BackendError> {
        let wanted = self.wanted.lock().remove(user).unwrap_or_default();
        let result = self.fetch_conversations(user).await;
        if !self.is_live() {
            return Ok(());
        }
        match result {
            Ok(list) => {
                let missing = wanted
                    .iter()
                    .any(|peer| !list.iter().any(|p| p.peer_id == *peer));
                if missing {
                    tracing::debug!(user = %user, "refreshed list lacks target, invalidating");
                    self.invalidate_conversations(user);
                    return Ok(());
                }
                let peers: Vec<UserId> = list.iter().map(|p| p.peer_id.clone()).collect();
                self.cache
                    .set(&conversations_key(user), CacheValue::Conversations(list));
                for peer in peers {
                    self.bus.emit(SyncEvent::ConversationUpdated {
                        owner: user.clone(),
                        peer,
                    });
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "conversation refresh failed");
                self.invalidate_conversations(user);
                Err(e)
            }
        }
    }

    /// Fetch `user`'s conversation list from the backend.
    ///
    /// The server keeps consumed ephemeral messages, so for the owner's
    /// own list they are taken out of `last_message` before anything
    /// caches the result.
    ///
    /// # Errors
    ///
    /// Returns the backend error unchanged.
    pub async fn fetch_conversations(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationProjection>, BackendError> {
        let mut list = self.backend.list_conversations(user).await?;
        if *user == self.owner {
            let dropped = projection::drop_consumed_last(
                &mut list,
                |m| m.is_ephemeral() && self.viewed.contains_message(m),
                |peer| {
                    self.cache
                        .peek(&messages_key(&self.owner, peer))
                        .and_then(CacheValue::into_messages)
                },
            );
            if dropped > 0 {
                tracing::debug!(owner = %self.owner, dropped, "consumed last messages dropped");
            }
        }
        Ok(list)
    }

    /// Prune a consumed message from the owner's caches and report the
    /// read to the server.
    pub async fn on_viewed(&self, message_id: &MessageId) {
        let prefix = owner_messages_prefix(&self.owner);
        let mut found: Option<Message> = None;
        for key in self.cache.keys().iter().filter(|k| k.starts_with(&prefix)) {
            let removed = self
                .cache
                .update(key, |value| match value {
                    CacheValue::Messages(list) => {
                        let hit = list.iter().find(|m| m.has_identity(message_id)).cloned();
                        merge::remove_identity(list, message_id);
                        hit
                    }
                    CacheValue::Conversations(_) => None,
                })
                .flatten();
            if found.is_none() {
                found = removed;
            }
        }
        self.rebuild_last(&self.owner, message_id);

        let server_id = match &found {
            Some(msg) if msg.receiver_id == self.owner && !msg.flags.seen => msg.id.clone(),
            Some(_) => None,
            None => (!message_id.is_temp()).then(|| message_id.clone()),
        };
        let Some(server_id) = server_id else {
            return;
        };
        match self.backend.mark_read(&server_id, &self.owner).await {
            Ok(()) => tracing::debug!(id = %server_id, "viewed message marked read"),
            Err(e) => {
                tracing::warn!(id = %server_id, error = %e, "failed to mark viewed message read");
            }
        }
    }

    /// Run [`on_viewed`](Self::on_viewed) for every `MessageViewed` event.
    pub fn watch_viewed(&self) -> Subscription {
        let me = self.me.clone();
        self.bus
            .subscribe_keyed(EventKind::MessageViewed, "sync.viewed", move |event| {
                let SyncEvent::MessageViewed { message_id } = event else {
                    return;
                };
                let Some(reconciler) = me.upgrade() else {
                    return;
                };
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    tracing::warn!(%message_id, "no runtime, viewed message not pruned");
                    return;
                };
                let message_id = message_id.clone();
                handle.spawn(async move {
                    reconciler.on_viewed(&message_id).await;
                });
            })
    }

    /// Mark every unread inbound message from `peer` as read.
    ///
    /// The cache is updated first; then each message is reported to the
    /// server. Unviewed ephemeral messages are left unread: they are read
    /// by viewing them. Returns how many messages were reported.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; the remaining messages are still
    /// attempted.
    pub async fn mark_conversation_read(&self, peer: &UserId) -> Result<usize, BackendError> {
        let owner = &self.owner;
        let ids: Vec<MessageId> = self
            .cache
            .update(&messages_key(owner, peer), |value| {
                let CacheValue::Messages(list) = value else {
                    return Vec::new();
                };
                list.iter_mut()
                    .filter(|m| m.receiver_id == *owner && !m.flags.seen && m.id.is_some())
                    .filter(|m| !m.is_ephemeral() || self.viewed.contains_message(m))
                    .filter_map(|m| {
                        m.flags.seen = true;
                        m.id.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();

        let cleared = self.cache.update(&conversations_key(owner), |value| {
            let CacheValue::Conversations(list) = value else {
                return false;
            };
            list.iter_mut()
                .find(|p| p.peer_id == *peer)
                .is_some_and(|entry| {
                    let changed = entry.has_new_message || entry.unread_count > 0;
                    entry.has_new_message = false;
                    entry.unread_count = 0;
                    changed
                })
        });
        if cleared == Some(true) {
            self.bus.emit(SyncEvent::ConversationUpdated {
                owner: owner.clone(),
                peer: peer.clone(),
            });
        }

        let mut first_error = None;
        for id in &ids {
            if let Err(e) = self.backend.mark_read(id, owner).await {
                tracing::warn!(%id, error = %e, "mark_read failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::debug!(peer = %peer, count = ids.len(), "conversation marked read");
        first_error.map_or(Ok(ids.len()), Err)
    }
}
