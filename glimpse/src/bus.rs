//! In-process event bus.
//!
//! Components publish [`SyncEvent`]s; consumers register callbacks per
//! [`EventKind`] and hold the returned [`Subscription`] for as long as they
//! want to receive events. Dropping the subscription unsubscribes.
//!
//! Critical kinds (new messages) are dispatched on a spawned task so the
//! publisher never waits on UI work; everything else is dispatched
//! synchronously, in registration order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use glimpse_proto::message::{Message, MessageId, UserId};
use glimpse_proto::row::RowField;

use crate::outbox::SendState;

/// Discriminant of a [`SyncEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A message addressed to the session owner arrived.
    MessageReceived,
    /// A message sent by the session owner was confirmed.
    MessageSent,
    /// A cached message changed in place.
    MessageUpdated,
    /// A message was removed.
    MessageDeleted,
    /// An optimistic placeholder was inserted.
    OptimisticAdded,
    /// An optimistic placeholder was replaced by its authoritative record.
    OptimisticReplaced,
    /// A pending send changed state.
    SendStatusChanged,
    /// A message's read flag flipped.
    ReadStatusChanged,
    /// A conversation-list projection changed.
    ConversationUpdated,
    /// An ephemeral message was permanently consumed.
    MessageViewed,
    /// Cache entries were dropped.
    CacheInvalidated,
}

impl EventKind {
    /// Kinds dispatched on the deferred fast path.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::MessageReceived | Self::MessageSent)
    }
}

/// Payload of a bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// See [`EventKind::MessageReceived`].
    MessageReceived {
        /// The received message.
        message: Message,
    },
    /// See [`EventKind::MessageSent`].
    MessageSent {
        /// The confirmed message.
        message: Message,
    },
    /// See [`EventKind::MessageUpdated`].
    MessageUpdated {
        /// The message after the change.
        message: Message,
        /// Columns that changed.
        changed: Vec<RowField>,
    },
    /// See [`EventKind::MessageDeleted`].
    MessageDeleted {
        /// Id of the removed message.
        id: MessageId,
    },
    /// See [`EventKind::OptimisticAdded`].
    OptimisticAdded {
        /// The placeholder.
        message: Message,
    },
    /// See [`EventKind::OptimisticReplaced`].
    OptimisticReplaced {
        /// Temp id of the replaced placeholder.
        temp_id: MessageId,
        /// The authoritative record.
        message: Message,
    },
    /// See [`EventKind::SendStatusChanged`].
    SendStatusChanged {
        /// Temp id of the pending send.
        temp_id: MessageId,
        /// New state.
        state: SendState,
        /// Attempts that have failed so far.
        retries: u32,
        /// Last error, when the state is `Failed` or a retry is scheduled.
        error: Option<String>,
    },
    /// See [`EventKind::ReadStatusChanged`].
    ReadStatusChanged {
        /// Message whose read flag changed.
        message_id: MessageId,
        /// Who sent the message.
        sender: UserId,
        /// Who read it.
        receiver: UserId,
        /// New read flag.
        seen: bool,
    },
    /// See [`EventKind::ConversationUpdated`].
    ConversationUpdated {
        /// Owner of the projection.
        owner: UserId,
        /// Peer of the projection.
        peer: UserId,
    },
    /// See [`EventKind::MessageViewed`].
    MessageViewed {
        /// The consumed message.
        message_id: MessageId,
    },
    /// See [`EventKind::CacheInvalidated`].
    CacheInvalidated {
        /// Exact key or prefix that was dropped.
        pattern: String,
    },
}

impl SyncEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::MessageSent { .. } => EventKind::MessageSent,
            Self::MessageUpdated { .. } => EventKind::MessageUpdated,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::OptimisticAdded { .. } => EventKind::OptimisticAdded,
            Self::OptimisticReplaced { .. } => EventKind::OptimisticReplaced,
            Self::SendStatusChanged { .. } => EventKind::SendStatusChanged,
            Self::ReadStatusChanged { .. } => EventKind::ReadStatusChanged,
            Self::ConversationUpdated { .. } => EventKind::ConversationUpdated,
            Self::MessageViewed { .. } => EventKind::MessageViewed,
            Self::CacheInvalidated { .. } => EventKind::CacheInvalidated,
        }
    }
}

/// Callback invoked for every matching event.
pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct ListenerSlot {
    id: u64,
    key: Option<String>,
    callback: Listener,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<EventKind, Vec<ListenerSlot>>,
    peaks: HashMap<EventKind, usize>,
}

struct BusInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    max_listeners: usize,
    emitted: AtomicU64,
    leak_warnings: AtomicU64,
}

/// Snapshot of listener bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusDiagnostics {
    /// Current listeners per kind.
    pub listener_counts: BTreeMap<EventKind, usize>,
    /// Highest listener count ever seen per kind.
    pub peak_counts: BTreeMap<EventKind, usize>,
    /// Number of times a kind went over the listener limit.
    pub leak_warnings: u64,
    /// Events published since creation.
    pub emitted: u64,
}

/// Typed publish/subscribe hub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("max_listeners", &self.inner.max_listeners)
            .field("emitted", &self.inner.emitted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus that warns once a kind has more than `max_listeners`.
    #[must_use]
    pub fn new(max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                max_listeners,
                emitted: AtomicU64::new(0),
                leak_warnings: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback` for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(kind, None, Arc::new(callback))
    }

    /// Register `callback` for `kind` under a listener key.
    ///
    /// A later registration with the same key and kind replaces this one,
    /// so re-mounting a consumer never stacks duplicate listeners. The
    /// replaced subscription's handle becomes inert.
    pub fn subscribe_keyed<F>(
        &self,
        kind: EventKind,
        key: impl Into<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(kind, Some(key.into()), Arc::new(callback))
    }

    fn register(&self, kind: EventKind, key: Option<String>, callback: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut registry = self.inner.registry.lock();
            let slots = registry.listeners.entry(kind).or_default();
            if let Some(key) = &key {
                slots.retain(|slot| slot.key.as_ref() != Some(key));
            }
            slots.push(ListenerSlot { id, key, callback });
            let count = slots.len();
            let peak = registry.peaks.entry(kind).or_insert(0);
            *peak = (*peak).max(count);
            count
        };

        if count > self.inner.max_listeners {
            self.inner.leak_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                ?kind,
                listeners = count,
                max = self.inner.max_listeners,
                "possible listener leak"
            );
        }

        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Publish an event to every listener of its kind.
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);

        let callbacks: Vec<Listener> = {
            let registry = self.inner.registry.lock();
            registry
                .listeners
                .get(&kind)
                .map(|slots| slots.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };
        if callbacks.is_empty() {
            tracing::trace!(?kind, "event without listeners");
            return;
        }

        if kind.is_critical()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                for callback in &callbacks {
                    callback(&event);
                }
            });
            return;
        }

        for callback in &callbacks {
            callback(&event);
        }
    }

    /// Number of listeners currently registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .registry
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Snapshot of listener bookkeeping.
    #[must_use]
    pub fn diagnostics(&self) -> BusDiagnostics {
        let registry = self.inner.registry.lock();
        BusDiagnostics {
            listener_counts: registry
                .listeners
                .iter()
                .filter(|(_, slots)| !slots.is_empty())
                .map(|(kind, slots)| (*kind, slots.len()))
                .collect(),
            peak_counts: registry.peaks.iter().map(|(k, v)| (*k, *v)).collect(),
            leak_warnings: self.inner.leak_warnings.load(Ordering::Relaxed),
            emitted: self.inner.emitted.load(Ordering::Relaxed),
        }
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.registry.lock().listeners.clear();
    }
}

/// Disposer handle returned by [`EventBus::subscribe`].
///
/// Unsubscribes on drop. Holding it past the bus's lifetime is harmless.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Kind this subscription listens to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut registry = inner.registry.lock();
            if let Some(slots) = registry.listeners.get_mut(&self.kind) {
                slots.retain(|slot| slot.id != self.id);
            }
        }
    }
}
