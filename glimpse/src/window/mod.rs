//! Sliding-window projection of a conversation.
//!
//! The visible window is derived, never stored: cached messages and the
//! send queue's placeholders are merged, consumed ephemeral messages are
//! dropped, and the most recent slice is kept. [`WindowProjector::open`]
//! paints from cache immediately and refreshes in the background when the
//! cache is stale or the window is short; [`WindowProjector::load_window`]
//! backfills older pages when filtering leaves too few messages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use glimpse_proto::message::{Message, UserId};

use crate::backend::{BackendError, ListQuery, MessageBackend};
use crate::bus::{EventBus, SyncEvent};
use crate::cache::{CacheStore, CacheValue, messages_key};
use crate::config::WindowConfig;
use crate::ephemeral::ViewedSet;
use crate::merge;
use crate::storage::DurableStore;

/// Placeholders of unfinished sends to a peer.
pub type PendingSource = Arc<dyn Fn(&UserId) -> Vec<Message> + Send + Sync>;

/// A [`PendingSource`] that never has anything pending.
#[must_use]
pub fn no_pending() -> PendingSource {
    Arc::new(|_| Vec::new())
}

/// Errors from window loading.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// The backend fetch failed.
    #[error("window fetch failed: {0}")]
    Fetch(#[from] BackendError),

    /// The owning session ended while the fetch was in flight.
    #[error("session ended during window load")]
    ShutDown,
}

/// Number of messages shown when `pending` sends are in flight.
#[must_use]
pub const fn window_limit(size: usize, pending: usize) -> usize {
    if pending == 0 {
        size
    } else {
        size + pending - 1
    }
}

/// Merge, filter, sort, and cut a conversation down to its visible window.
///
/// Ephemeral messages for which `is_viewed` holds are removed. The window
/// grows by one slot per in-flight placeholder beyond the first so fresh
/// sends never push confirmed messages out mid-send.
pub fn project_window(
    cached: &[Message],
    pending: &[Message],
    is_viewed: impl Fn(&Message) -> bool,
    size: usize,
) -> Vec<Message> {
    let mut all = Vec::with_capacity(cached.len() + pending.len());
    all.extend_from_slice(cached);
    all.extend_from_slice(pending);
    let mut merged = merge::merge_messages(&all);
    merged.retain(|m| !(m.is_ephemeral() && is_viewed(m)));

    let in_flight = merged
        .iter()
        .filter(|m| m.is_optimistic() && m.flags.sending)
        .count();
    let limit = window_limit(size, in_flight);
    let skip = merged.len().saturating_sub(limit);
    merged.split_off(skip)
}

/// What [`WindowProjector::open`] painted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowView {
    /// Visible messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether anything was cached for the conversation.
    pub cached: bool,
    /// Whether a background refresh is running.
    pub refreshing: bool,
}

/// Computes visible windows for one signed-in user.
pub struct WindowProjector<B: MessageBackend, S: DurableStore> {
    owner: UserId,
    config: WindowConfig,
    backend: Arc<B>,
    cache: Arc<CacheStore<S>>,
    viewed: Arc<ViewedSet<S>>,
    pending: PendingSource,
    bus: EventBus,
    loading: Mutex<HashSet<UserId>>,
    /// Extra history slots per peer from `load_older`.
    expanded: Mutex<HashMap<UserId, usize>>,
    live: AtomicBool,
    me: Weak<Self>,
}

impl<B: MessageBackend, S: DurableStore> std::fmt::Debug for WindowProjector<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowProjector")
            .field("owner", &self.owner)
            .field("size", &self.config.size)
            .finish_non_exhaustive()
    }
}

impl<B: MessageBackend, S: DurableStore> WindowProjector<B, S> {
    /// Create a projector for `owner`.
    #[must_use]
    pub fn new(
        owner: UserId,
        config: WindowConfig,
        backend: Arc<B>,
        cache: Arc<CacheStore<S>>,
        viewed: Arc<ViewedSet<S>>,
        pending: PendingSource,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            owner,
            config,
            backend,
            cache,
            viewed,
            pending,
            bus,
            loading: Mutex::new(HashSet::new()),
            expanded: Mutex::new(HashMap::new()),
            live: AtomicBool::new(true),
            me: me.clone(),
        })
    }

    /// Whether the owning session is still active.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// End the session; loads in flight discard their results.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.expanded.lock().clear();
    }

    fn size_for(&self, peer: &UserId) -> usize {
        self.config.size + self.expanded.lock().get(peer).copied().unwrap_or(0)
    }

    fn cached_messages(&self, peer: &UserId) -> Vec<Message> {
        self.cache
            .peek(&messages_key(&self.owner, peer))
            .and_then(CacheValue::into_messages)
            .unwrap_or_default()
    }

    /// The current window for `peer`, from cache and pending sends only.
    #[must_use]
    pub fn project(&self, peer: &UserId) -> Vec<Message> {
        let cached = self.cached_messages(peer);
        let pending = (self.pending)(peer);
        project_window(
            &cached,
            &pending,
            |m| self.viewed.contains_message(m),
            self.size_for(peer),
        )
    }

    /// Paint `peer`'s window from cache and refresh in the background if
    /// the cache is older than `stale_after` or the window is not full.
    pub fn open(&self, peer: &UserId) -> WindowView {
        self.expanded.lock().remove(peer);
        let key = messages_key(&self.owner, peer);
        let messages = self.project(peer);
        let age = self.cache.age(&key);
        let stale = age.is_none_or(|age| age > self.config.stale_after);
        let short = messages.len() < self.config.size;
        let refreshing = (stale || short) && self.spawn_refresh(peer);
        tracing::debug!(peer = %peer, shown = messages.len(), stale, short, "window opened");
        WindowView {
            messages,
            cached: age.is_some(),
            refreshing,
        }
    }

    fn spawn_refresh(&self, peer: &UserId) -> bool {
        if !self.loading.lock().insert(peer.clone()) {
            return true;
        }
        let spawned = match (self.me.upgrade(), tokio::runtime::Handle::try_current()) {
            (Some(projector), Ok(handle)) => {
                let peer = peer.clone();
                handle.spawn(async move {
                    if let Err(e) = projector.load_window(&peer).await {
                        tracing::warn!(
                            peer = %peer,
                            error = %e,
                            "background window refresh failed"
                        );
                    }
                    projector.loading.lock().remove(&peer);
                });
                true
            }
            _ => false,
        };
        if !spawned {
            self.loading.lock().remove(peer);
        }
        spawned
    }

    /// Whether a background refresh for `peer` is running.
    #[must_use]
    pub fn is_loading(&self, peer: &UserId) -> bool {
        self.loading.lock().contains(peer)
    }

    /// Fetch the latest page for `peer`, backfilling older pages until the
    /// filtered window is full, the history runs out, or
    /// `max_backfill_pages` extra pages were read.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Fetch`] if a page fails (nothing is cached
    /// from the failed load) and [`WindowError::ShutDown`] if the session
    /// ended meanwhile.
    pub async fn load_window(&self, peer: &UserId) -> Result<Vec<Message>, WindowError> {
        let size = self.config.size;
        let limit = size * self.config.oversample.max(1);
        let mut fetched: Vec<Message> = Vec::new();
        let mut query = ListQuery::latest(limit);

        for page in 0..=self.config.max_backfill_pages {
            let batch = self.backend.list_messages(&self.owner, peer, query).await?;
            if !self.is_live() {
                return Err(WindowError::ShutDown);
            }
            let exhausted = batch.len() < limit;
            let oldest = batch.iter().map(|m| m.created_at).min();
            fetched.extend(batch);

            let mut candidates = self.cached_messages(peer);
            candidates.extend(fetched.iter().cloned());
            let visible = project_window(
                &candidates,
                &[],
                |m| self.viewed.contains_message(m),
                size,
            )
            .len();
            if visible >= size || exhausted {
                break;
            }
            let Some(oldest) = oldest else {
                break;
            };
            tracing::debug!(peer = %peer, page = page + 1, visible, "backfilling window");
            query = ListQuery::older_than(oldest, limit);
        }

        let count = fetched.len();
        self.cache.upsert(&messages_key(&self.owner, peer), |current| {
            let mut list = current
                .and_then(CacheValue::into_messages)
                .unwrap_or_default();
            merge::merge_into(&mut list, fetched);
            CacheValue::Messages(list)
        });
        tracing::debug!(peer = %peer, fetched = count, "window loaded");
        self.bus.emit(SyncEvent::ConversationUpdated {
            owner: self.owner.clone(),
            peer: peer.clone(),
        });
        Ok(self.project(peer))
    }

    /// Extend `peer`'s window by one page of older history.
    ///
    /// Returns how many older messages were loaded; zero means the start
    /// of the conversation was reached.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Fetch`] if the page fails.
    pub async fn load_older(&self, peer: &UserId) -> Result<usize, WindowError> {
        let key = messages_key(&self.owner, peer);
        let visible = self.project(peer);
        let cursor = visible
            .iter()
            .filter(|m| !m.is_optimistic())
            .map(|m| m.created_at)
            .min();
        let limit = self.config.size;
        let query = match cursor {
            Some(cursor) => ListQuery::older_than(cursor, limit),
            None => ListQuery::latest(limit),
        };

        let batch = self.backend.list_messages(&self.owner, peer, query).await?;
        if !self.is_live() {
            return Err(WindowError::ShutDown);
        }
        let count = batch.len();
        if count > 0 {
            let merged = self.cache.update(&key, |value| {
                if let CacheValue::Messages(list) = value {
                    merge::merge_into(list, batch.iter().cloned());
                }
            });
            if merged.is_none() {
                self.cache.set(&key, CacheValue::Messages(batch));
            }
            *self.expanded.lock().entry(peer.clone()).or_insert(0) += count;
        }
        tracing::debug!(peer = %peer, count, "older history loaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glimpse_proto::message::{MessageId, Timestamp};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::loopback::LoopbackBackend;
    use crate::storage::MemoryStore;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn text(id: u64) -> Message {
        Message::authoritative(
            id.to_string(),
            &bob(),
            &alice(),
            Timestamp::from_millis(id * 10_000),
        )
        .with_caption(format!("message {id}"))
    }

    fn ids(list: &[Message]) -> Vec<String> {
        list.iter()
            .filter_map(|m| m.id.as_ref().map(|id| id.as_str().to_string()))
            .collect()
    }

    #[test]
    fn three_messages_project_in_order() {
        let cached = vec![text(3), text(1), text(2)];
        let window = project_window(&cached, &[], |_| false, 10);
        assert_eq!(ids(&window), vec!["1", "2", "3"]);
    }

    #[test]
    fn twelve_cached_keep_ten_most_recent() {
        let cached: Vec<Message> = (1..=12).map(text).collect();
        let window = project_window(&cached, &[], |_| false, 10);
        assert_eq!(window.len(), 10);
        assert_eq!(ids(&window).first().map(String::as_str), Some("3"));
        assert_eq!(ids(&window).last().map(String::as_str), Some("12"));
    }

    #[test]
    fn pending_sends_expand_window() {
        let cached: Vec<Message> = (1..=12).map(text).collect();
        let pending: Vec<Message> = (0..3)
            .map(|i| {
                Message::optimistic(
                    MessageId::temp(),
                    &alice(),
                    &bob(),
                    Timestamp::from_millis(200_000 + i),
                )
                .with_caption(format!("draft {i}"))
            })
            .collect();
        let window = project_window(&cached, &pending, |_| false, 10);
        assert_eq!(window_limit(10, 3), 12);
        assert_eq!(window.len(), 12);
        assert_eq!(window.iter().filter(|m| m.is_optimistic()).count(), 3);
    }

    #[test]
    fn viewed_ephemeral_messages_are_dropped() {
        let cached = vec![text(1).nsfw(), text(2), text(3).view_once()];
        let window = project_window(
            &cached,
            &[],
            |m| m.id.as_ref().is_some_and(|id| id.as_str() != "3"),
            10,
        );
        // 2 is viewed but not ephemeral; 3 is ephemeral but not viewed.
        assert_eq!(ids(&window), vec!["2", "3"]);
    }

    #[test]
    fn malformed_records_never_reach_the_window() {
        let mut broken = text(2);
        broken.id = None;
        let window = project_window(&[text(1), broken], &[], |_| false, 10);
        assert_eq!(ids(&window), vec!["1"]);
    }

    struct Harness {
        projector: Arc<WindowProjector<LoopbackBackend, MemoryStore>>,
        backend: Arc<LoopbackBackend>,
        cache: Arc<CacheStore<MemoryStore>>,
        viewed: Arc<ViewedSet<MemoryStore>>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let backend = Arc::new(LoopbackBackend::new());
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
        let cache =
            CacheStore::with_clock(CacheConfig::default(), Arc::clone(&store), clock.clock());
        let viewed = Arc::new(ViewedSet::new(store));
        let projector = WindowProjector::new(
            alice(),
            WindowConfig::default(),
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&viewed),
            no_pending(),
            EventBus::new(10),
        );
        Harness {
            projector,
            backend,
            cache,
            viewed,
            clock,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn open_without_cache_loads_in_background() {
        let h = harness();
        for i in 1..=12 {
            h.backend.seed(text(i));
        }
        let view = h.projector.open(&bob());
        assert!(view.messages.is_empty());
        assert!(!view.cached);
        assert!(view.refreshing);

        settle().await;
        assert!(!h.projector.is_loading(&bob()));
        let window = h.projector.project(&bob());
        assert_eq!(window.len(), 10);
        assert_eq!(ids(&window).last().map(String::as_str), Some("12"));
    }

    #[tokio::test]
    async fn fresh_full_cache_paints_without_refresh() {
        let h = harness();
        h.cache.set(
            &messages_key(&alice(), &bob()),
            CacheValue::Messages((1..=12).map(text).collect()),
        );
        let view = h.projector.open(&bob());
        assert_eq!(view.messages.len(), 10);
        assert!(view.cached);
        assert!(!view.refreshing);
        assert_eq!(h.backend.list_calls(), 0);
    }

    #[tokio::test]
    async fn stale_cache_paints_then_refreshes() {
        let h = harness();
        h.cache.set(
            &messages_key(&alice(), &bob()),
            CacheValue::Messages((1..=12).map(text).collect()),
        );
        h.clock.advance(Duration::from_secs(121));
        h.backend.seed(text(13));

        let view = h.projector.open(&bob());
        assert_eq!(ids(&view.messages).last().map(String::as_str), Some("12"));
        assert!(view.refreshing);

        settle().await;
        let window = h.projector.project(&bob());
        assert_eq!(ids(&window).last().map(String::as_str), Some("13"));
        assert_eq!(window.len(), 10);
    }

    #[tokio::test]
    async fn backfill_compensates_for_viewed_ephemerals() {
        let h = harness();
        // 30 messages; the newest 25 are consumed view-once content.
        for i in 1..=30 {
            let msg = if i > 5 { text(i).view_once() } else { text(i) };
            h.backend.seed(msg);
        }
        for i in 6..=30 {
            h.viewed.mark(&MessageId::new(i.to_string())).await.unwrap();
        }

        let window = h.projector.load_window(&bob()).await.unwrap();
        assert_eq!(ids(&window), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(h.backend.list_calls(), 2);
    }

    #[tokio::test]
    async fn backfill_stops_at_page_limit() {
        let h = harness();
        for i in 1..=200 {
            h.backend.seed(text(i).view_once());
            h.viewed.mark(&MessageId::new(i.to_string())).await.unwrap();
        }
        let window = h.projector.load_window(&bob()).await.unwrap();
        assert!(window.is_empty());
        assert_eq!(h.backend.list_calls(), 1 + WindowConfig::default().max_backfill_pages);
    }

    #[tokio::test]
    async fn failed_load_caches_nothing() {
        let h = harness();
        h.backend.set_offline(true);
        assert!(matches!(
            h.projector.load_window(&bob()).await,
            Err(WindowError::Fetch(BackendError::Offline))
        ));
        assert!(!h.cache.contains(&messages_key(&alice(), &bob())));
    }

    #[tokio::test]
    async fn load_older_extends_history() {
        let h = harness();
        for i in 1..=25 {
            h.backend.seed(text(i));
        }
        h.projector.load_window(&bob()).await.unwrap();
        assert_eq!(h.projector.project(&bob()).len(), 10);

        let added = h.projector.load_older(&bob()).await.unwrap();
        assert_eq!(added, 10);
        let window = h.projector.project(&bob());
        assert_eq!(window.len(), 20);
        assert_eq!(ids(&window).first().map(String::as_str), Some("6"));

        h.projector.load_older(&bob()).await.unwrap();
        assert_eq!(h.projector.load_older(&bob()).await.unwrap(), 0);
        assert_eq!(h.projector.project(&bob()).len(), 25);
    }
}
