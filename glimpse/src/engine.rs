//! The sync engine: one object the host constructs, initializes for the
//! signed-in user, and tears down on sign-out.
//!
//! All collaborators are injected as `Arc`s. [`SyncEngine::initialize`]
//! restores durable state, wires the realtime stream into the reconciler,
//! and hooks the send queue and viewing timer to the app lifecycle.
//! [`SyncEngine::teardown`] stops all of it; results of network calls still
//! in flight are discarded.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use glimpse_proto::message::{MediaKind, Message, MessageId, UserId, ValidationError};
use glimpse_proto::projection::ConversationProjection;

use crate::backend::{BackendError, LocalMedia, MediaPipeline, MessageBackend};
use crate::bus::{EventBus, EventKind, Subscription, SyncEvent};
use crate::cache::{CacheError, CacheStore, CacheValue, conversations_key};
use crate::config::SyncConfig;
use crate::ephemeral::{StartOutcome, ViewedError, ViewedSet, ViewingTimer};
use crate::lifecycle::{AppState, Lifecycle};
use crate::outbox::{OUTBOX_KEY, SendError, SendMode, SendQueue};
use crate::storage::{DurableStore, StorageError};
use crate::sync::{RealtimeHandle, Reconciler};
use crate::window::{WindowError, WindowProjector, WindowView};

/// Errors surfaced by the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `initialize` was called while a session is active.
    #[error("engine already initialized for {0}")]
    AlreadyInitialized(UserId),

    /// An operation needs a session.
    #[error("engine not initialized")]
    NotInitialized,

    /// Cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Viewed-set persistence failure.
    #[error(transparent)]
    Viewed(#[from] ViewedError),

    /// Send queue failure.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Window load failure.
    #[error(transparent)]
    Window(#[from] WindowError),

    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The message record is unusable.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Durable store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Components of one signed-in session.
struct Components<B: MessageBackend, M: MediaPipeline, S: DurableStore> {
    owner: UserId,
    outbox: Arc<SendQueue<B, M, S>>,
    reconciler: Arc<Reconciler<B, S>>,
    projector: Arc<WindowProjector<B, S>>,
    timer: Arc<ViewingTimer<S>>,
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> Clone for Components<B, M, S> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            outbox: Arc::clone(&self.outbox),
            reconciler: Arc::clone(&self.reconciler),
            projector: Arc::clone(&self.projector),
            timer: Arc::clone(&self.timer),
        }
    }
}

struct Session<B: MessageBackend, M: MediaPipeline, S: DurableStore> {
    components: Components<B, M, S>,
    realtime: RealtimeHandle,
    viewed_subscription: Subscription,
    lifecycle_tasks: Vec<JoinHandle<()>>,
}

/// Client-side message sync engine.
pub struct SyncEngine<B: MessageBackend, M: MediaPipeline, S: DurableStore> {
    config: SyncConfig,
    backend: Arc<B>,
    media: Arc<M>,
    store: Arc<S>,
    cache: Arc<CacheStore<S>>,
    viewed: Arc<ViewedSet<S>>,
    bus: EventBus,
    lifecycle: Arc<Lifecycle>,
    session: Mutex<Option<Session<B, M, S>>>,
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> std::fmt::Debug for SyncEngine<B, M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &self.owner())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> SyncEngine<B, M, S> {
    /// Build an engine over the given collaborators. Nothing runs until
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(
        config: SyncConfig,
        backend: Arc<B>,
        media: Arc<M>,
        store: Arc<S>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let cache = CacheStore::new(config.cache.clone(), Arc::clone(&store));
        let viewed = Arc::new(ViewedSet::new(Arc::clone(&store)));
        let bus = EventBus::new(config.events.max_listeners_per_event);
        Self {
            config,
            backend,
            media,
            store,
            cache,
            viewed,
            bus,
            lifecycle,
            session: Mutex::new(None),
        }
    }

    /// The event bus hosts subscribe to.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The shared cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<CacheStore<S>> {
        &self.cache
    }

    /// The durable set of consumed ephemeral messages.
    #[must_use]
    pub const fn viewed(&self) -> &Arc<ViewedSet<S>> {
        &self.viewed
    }

    /// The lifecycle signal the engine follows.
    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// The signed-in user, if a session is active.
    #[must_use]
    pub fn owner(&self) -> Option<UserId> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.components.owner.clone())
    }

    /// Whether a session is active.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Subscribe to engine events.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, callback)
    }

    /// Forward a platform foreground/background transition.
    pub fn set_app_state(&self, state: AppState) {
        self.lifecycle.set(state);
    }

    /// Start a session for `owner`.
    ///
    /// Durable state is restored first; restore failures are logged and the
    /// session starts with whatever could be loaded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyInitialized`] if a session is active.
    pub async fn initialize(&self, owner: UserId) -> Result<(), EngineError> {
        if let Some(current) = self.owner() {
            return Err(EngineError::AlreadyInitialized(current));
        }

        match self.cache.restore().await {
            Ok(count) => tracing::debug!(count, "cache restored"),
            Err(e) => tracing::warn!(error = %e, "cache restore failed"),
        }
        if let Err(e) = self.viewed.restore().await {
            tracing::warn!(error = %e, "viewed set restore failed");
        }

        let outbox = SendQueue::new(
            owner.clone(),
            self.config.outbox.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.media),
            Arc::clone(&self.cache),
            Arc::clone(&self.store),
            self.bus.clone(),
        );
        let reconciler = Reconciler::new(
            owner.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            Arc::clone(&self.viewed),
            self.bus.clone(),
            &self.config.events,
        );
        let pending_outbox = Arc::downgrade(&outbox);
        let projector = WindowProjector::new(
            owner.clone(),
            self.config.window.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            Arc::clone(&self.viewed),
            Arc::new(move |peer: &UserId| {
                pending_outbox
                    .upgrade()
                    .map(|outbox| outbox.pending_for(peer))
                    .unwrap_or_default()
            }),
            self.bus.clone(),
        );
        let timer = ViewingTimer::new(
            self.config.ephemeral.clone(),
            Arc::clone(&self.viewed),
            self.bus.clone(),
        );

        let realtime = reconciler.start(self.backend.subscribe());
        let viewed_subscription = reconciler.watch_viewed();
        let lifecycle_tasks = vec![
            outbox.watch_lifecycle(self.lifecycle.subscribe()),
            timer.watch_lifecycle(self.lifecycle.subscribe()),
        ];

        if let Err(e) = outbox.restore().await {
            tracing::warn!(error = %e, "outbox restore failed");
        }

        let session = Session {
            components: Components {
                owner: owner.clone(),
                outbox,
                reconciler,
                projector,
                timer,
            },
            realtime,
            viewed_subscription,
            lifecycle_tasks,
        };
        let displaced = {
            let mut slot = self.session.lock();
            if let Some(existing) = slot.as_ref() {
                Err(existing.components.owner.clone())
            } else {
                *slot = Some(session);
                Ok(())
            }
        };
        if let Err(current) = displaced {
            return Err(EngineError::AlreadyInitialized(current));
        }
        tracing::info!(owner = %owner, "sync engine initialized");
        Ok(())
    }

    /// End the session: stop realtime processing, the send worker, and all
    /// viewing timers, then flush the cache.
    pub async fn teardown(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let Session {
            components,
            realtime,
            viewed_subscription,
            lifecycle_tasks,
        } = session;
        realtime.stop();
        viewed_subscription.unsubscribe();
        for task in lifecycle_tasks {
            task.abort();
        }
        components.outbox.shutdown();
        components.reconciler.shutdown();
        components.projector.shutdown();
        components.timer.clear();

        if let Err(e) = self.cache.flush().await {
            tracing::warn!(error = %e, "cache flush on teardown failed");
        }
        tracing::info!(owner = %components.owner, "sync engine torn down");
    }

    /// Tear down and erase every durable trace of the account: cache,
    /// viewed set, and queued sends.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; the in-memory state is cleared
    /// regardless.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.teardown().await;
        self.cache.clear();
        self.cache.flush().await?;
        self.viewed.reset().await?;
        self.store.remove(OUTBOX_KEY).await?;
        tracing::info!("sync state reset");
        Ok(())
    }

    fn components(&self) -> Result<Components<B, M, S>, EngineError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.components.clone())
            .ok_or(EngineError::NotInitialized)
    }

    /// Paint a conversation from cache, refreshing in the background when
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub fn open_conversation(&self, peer: &UserId) -> Result<WindowView, EngineError> {
        Ok(self.components()?.projector.open(peer))
    }

    /// The current window for `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub fn window(&self, peer: &UserId) -> Result<Vec<Message>, EngineError> {
        Ok(self.components()?.projector.project(peer))
    }

    /// Fetch `peer`'s window now, with backfill.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Window`] if the load fails.
    pub async fn refresh_conversation(&self, peer: &UserId) -> Result<Vec<Message>, EngineError> {
        let projector = self.components()?.projector;
        Ok(projector.load_window(peer).await?)
    }

    /// Load one more page of history for `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Window`] if the page fails.
    pub async fn load_older(&self, peer: &UserId) -> Result<usize, EngineError> {
        let projector = self.components()?.projector;
        Ok(projector.load_older(peer).await?)
    }

    /// The signed-in user's conversation list, cached single-flight.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cache`] if the fetch fails.
    pub async fn conversations(&self) -> Result<Vec<ConversationProjection>, EngineError> {
        let Components {
            owner, reconciler, ..
        } = self.components()?;
        let fetch_owner = owner.clone();
        let value = self
            .cache
            .get_or_fetch(&conversations_key(&owner), None, move || async move {
                reconciler
                    .fetch_conversations(&fetch_owner)
                    .await
                    .map(CacheValue::Conversations)
            })
            .await?;
        Ok(value.into_conversations().unwrap_or_default())
    }

    /// Queue a message to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Send`] if validation fails.
    pub async fn send(
        &self,
        peer: &UserId,
        media: Option<LocalMedia>,
        caption: Option<String>,
        mode: SendMode,
    ) -> Result<MessageId, EngineError> {
        let outbox = self.components()?.outbox;
        Ok(outbox.enqueue(peer, media, caption, mode).await?)
    }

    /// Requeue a failed send.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Send`] if the send is unknown or not failed.
    pub async fn retry_send(&self, temp_id: &MessageId) -> Result<(), EngineError> {
        let outbox = self.components()?.outbox;
        Ok(outbox.retry(temp_id).await?)
    }

    /// Drop a queued or failed send.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Send`] if the send is unknown or in flight.
    pub async fn cancel_send(&self, temp_id: &MessageId) -> Result<(), EngineError> {
        let outbox = self.components()?.outbox;
        Ok(outbox.cancel(temp_id).await?)
    }

    /// Start viewing `message`. Still images and captions use the static
    /// duration; videos use `duration` when known.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the message has no identity.
    pub fn view(
        &self,
        message: &Message,
        duration: Option<Duration>,
    ) -> Result<StartOutcome, EngineError> {
        let timer = self.components()?.timer;
        let id = message.identity().ok_or(ValidationError::MissingIdentity)?;
        if self.viewed.contains_message(message) {
            return Ok(StartOutcome::AlreadyViewed);
        }
        let kind = message.media.as_ref().map_or(MediaKind::Image, |m| m.kind);
        Ok(timer.start(id, kind, duration))
    }

    /// Report the real length of a video being viewed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub fn set_media_duration(
        &self,
        message_id: &MessageId,
        duration: Duration,
    ) -> Result<bool, EngineError> {
        Ok(self.components()?.timer.set_media_duration(message_id, duration))
    }

    /// Video playback finished; the message is consumed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub async fn playback_ended(&self, message_id: &MessageId) -> Result<bool, EngineError> {
        let timer = self.components()?.timer;
        Ok(timer.playback_ended(message_id).await)
    }

    /// The viewer was closed early. With `mark`, the message counts as
    /// consumed anyway.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub async fn stop_viewing(
        &self,
        message_id: &MessageId,
        mark: bool,
    ) -> Result<bool, EngineError> {
        let timer = self.components()?.timer;
        Ok(timer.stop(message_id, mark).await)
    }

    /// Viewing progress of `message_id`, in `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInitialized`] without a session.
    pub fn viewing_progress(&self, message_id: &MessageId) -> Result<Option<f64>, EngineError> {
        Ok(self.components()?.timer.progress(message_id))
    }

    /// Mark everything `peer` sent as read.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Backend`] if a read receipt fails.
    pub async fn mark_conversation_read(&self, peer: &UserId) -> Result<usize, EngineError> {
        let reconciler = self.components()?.reconciler;
        Ok(reconciler.mark_conversation_read(peer).await?)
    }
}
