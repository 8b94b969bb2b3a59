//! Per-message viewing timers.
//!
//! One [`ViewingSession`] per message being viewed. Each running session
//! owns a sleeper task; pausing aborts the sleeper and freezes the elapsed
//! time, resuming spawns a new sleeper for the remainder. An epoch number
//! guards against a sleeper from an earlier schedule completing a session
//! that was rescheduled in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use glimpse_proto::message::{MediaKind, MessageId};

use crate::bus::{EventBus, SyncEvent};
use crate::config::EphemeralConfig;
use crate::lifecycle::AppState;
use crate::storage::DurableStore;

use super::viewed::ViewedSet;

/// How the viewing duration is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewingMode {
    /// Fixed duration.
    Static,
    /// Media playback duration plus a fallback buffer.
    Motion,
}

impl From<MediaKind> for ViewingMode {
    fn from(kind: MediaKind) -> Self {
        if kind.is_motion() {
            Self::Motion
        } else {
            Self::Static
        }
    }
}

/// Observable state of a message's viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewingState {
    /// Timer running.
    Viewing,
    /// Timer frozen (app in background or explicit pause).
    Paused,
    /// Consumed; will never be shown again.
    Completed,
}

/// Result of [`ViewingTimer::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session began.
    Started,
    /// A session for this message is already open.
    AlreadyRunning,
    /// The message was consumed before; nothing happens.
    AlreadyViewed,
}

/// One open viewing.
#[derive(Debug, Clone)]
pub struct ViewingSession {
    /// Message being viewed.
    pub message_id: MessageId,
    /// Duration source.
    pub mode: ViewingMode,
    /// When viewing began.
    pub started_at: Instant,
    /// Length of the content itself; progress is measured against it.
    pub media_duration: Duration,
    /// Current state.
    pub state: ViewingState,
    fire_after: Duration,
    elapsed_before: Duration,
    running_since: Option<Instant>,
}

impl ViewingSession {
    /// Viewing time accumulated so far, excluding paused periods.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.elapsed_before
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Fraction of the content viewed, in `0.0..=1.0`.
    #[must_use]
    pub fn progress(&self, now: Instant) -> f64 {
        if self.media_duration.is_zero() {
            return 1.0;
        }
        (self.elapsed(now).as_secs_f64() / self.media_duration.as_secs_f64()).min(1.0)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.fire_after.saturating_sub(self.elapsed(now))
    }

    fn freeze(&mut self, now: Instant) {
        self.elapsed_before = self.elapsed(now);
        self.running_since = None;
        self.state = ViewingState::Paused;
    }

    fn thaw(&mut self, now: Instant) {
        self.running_since = Some(now);
        self.state = ViewingState::Viewing;
    }
}

struct SessionSlot {
    session: ViewingSession,
    task: Option<JoinHandle<()>>,
    epoch: u64,
}

impl SessionSlot {
    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drives viewing sessions and records completions in the [`ViewedSet`].
pub struct ViewingTimer<S: DurableStore> {
    config: EphemeralConfig,
    viewed: Arc<ViewedSet<S>>,
    bus: EventBus,
    sessions: Mutex<HashMap<MessageId, SessionSlot>>,
    next_epoch: AtomicU64,
    backgrounded: AtomicBool,
    me: Weak<Self>,
}

impl<S: DurableStore> std::fmt::Debug for ViewingTimer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewingTimer")
            .field("active", &self.active_count())
            .field("backgrounded", &self.backgrounded.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<S: DurableStore> ViewingTimer<S> {
    /// Create a timer recording completions in `viewed` and announcing them
    /// on `bus`.
    #[must_use]
    pub fn new(config: EphemeralConfig, viewed: Arc<ViewedSet<S>>, bus: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            viewed,
            bus,
            sessions: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            backgrounded: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// The viewed set this timer writes to.
    #[must_use]
    pub const fn viewed(&self) -> &Arc<ViewedSet<S>> {
        &self.viewed
    }

    /// Begin viewing `message_id`.
    ///
    /// `duration` is the media's playback length when already known; it is
    /// ignored for still images.
    pub fn start(
        &self,
        message_id: &MessageId,
        kind: MediaKind,
        duration: Option<Duration>,
    ) -> StartOutcome {
        if self.viewed.contains(message_id) {
            tracing::debug!(%message_id, "already viewed, not starting timer");
            return StartOutcome::AlreadyViewed;
        }
        let mode = ViewingMode::from(kind);
        let (media_duration, fire_after) = self.durations(mode, duration);
        let now = Instant::now();
        let running = !self.backgrounded.load(Ordering::SeqCst);

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(message_id) {
            return StartOutcome::AlreadyRunning;
        }
        let session = ViewingSession {
            message_id: message_id.clone(),
            mode,
            started_at: now,
            media_duration,
            state: if running {
                ViewingState::Viewing
            } else {
                ViewingState::Paused
            },
            fire_after,
            elapsed_before: Duration::ZERO,
            running_since: running.then_some(now),
        };
        let mut slot = SessionSlot {
            session,
            task: None,
            epoch: 0,
        };
        if running {
            self.schedule(&mut slot, now);
        }
        sessions.insert(message_id.clone(), slot);
        tracing::debug!(%message_id, ?mode, ?fire_after, "viewing started");
        StartOutcome::Started
    }

    fn durations(&self, mode: ViewingMode, known: Option<Duration>) -> (Duration, Duration) {
        match mode {
            ViewingMode::Static => (self.config.static_duration, self.config.static_duration),
            ViewingMode::Motion => {
                let media = known.unwrap_or(self.config.default_motion_duration);
                (media, media + self.config.motion_buffer)
            }
        }
    }

    fn schedule(&self, slot: &mut SessionSlot, now: Instant) {
        slot.abort();
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        slot.epoch = epoch;
        let remaining = slot.session.remaining(now);
        let message_id = slot.session.message_id.clone();
        let timer = self.me.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%message_id, "no runtime, viewing timer not armed");
            return;
        };
        slot.task = Some(handle.spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(timer) = timer.upgrade() {
                timer.elapsed(&message_id, epoch).await;
            }
        }));
    }

    /// Sleeper callback: complete only if the schedule is still current.
    async fn elapsed(&self, message_id: &MessageId, epoch: u64) {
        let current = {
            let mut sessions = self.sessions.lock();
            let is_current = sessions.get(message_id).is_some_and(|s| s.epoch == epoch);
            if is_current {
                // Dropping our own handle detaches; aborting would cancel us.
                sessions.remove(message_id);
            }
            is_current
        };
        if current {
            self.complete(message_id).await;
        }
    }

    async fn complete(&self, message_id: &MessageId) {
        let newly_viewed = match self.viewed.mark(message_id).await {
            Ok(newly) => newly,
            Err(e) => {
                tracing::warn!(%message_id, error = %e, "viewed flag kept in memory only");
                true
            }
        };
        if newly_viewed {
            tracing::debug!(%message_id, "message viewed");
            self.bus.emit(SyncEvent::MessageViewed {
                message_id: message_id.clone(),
            });
        }
    }

    /// Apply the real playback length of motion media.
    ///
    /// Returns `false` for unknown sessions and still images.
    pub fn set_media_duration(&self, message_id: &MessageId, duration: Duration) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let Some(slot) = sessions.get_mut(message_id) else {
            return false;
        };
        if slot.session.mode != ViewingMode::Motion {
            return false;
        }
        slot.session.media_duration = duration;
        slot.session.fire_after = duration + self.config.motion_buffer;
        if slot.session.state == ViewingState::Viewing {
            self.schedule(slot, now);
        }
        true
    }

    /// Freeze one session. Returns `false` if it is not running.
    pub fn pause(&self, message_id: &MessageId) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(message_id) {
            Some(slot) if slot.session.state == ViewingState::Viewing => {
                slot.abort();
                slot.session.freeze(now);
                true
            }
            _ => false,
        }
    }

    /// Resume one session with its remaining time. Returns `false` if it is
    /// not paused.
    pub fn resume(&self, message_id: &MessageId) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(message_id) {
            Some(slot) if slot.session.state == ViewingState::Paused => {
                slot.session.thaw(now);
                self.schedule(slot, now);
                true
            }
            _ => false,
        }
    }

    /// Freeze every running session (app went to background).
    pub fn pause_all(&self) {
        self.backgrounded.store(true, Ordering::SeqCst);
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        for slot in sessions.values_mut() {
            if slot.session.state == ViewingState::Viewing {
                slot.abort();
                slot.session.freeze(now);
            }
        }
    }

    /// Resume every paused session (app returned to foreground).
    pub fn resume_all(&self) {
        self.backgrounded.store(false, Ordering::SeqCst);
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        for slot in sessions.values_mut() {
            if slot.session.state == ViewingState::Paused {
                slot.session.thaw(now);
                self.schedule(slot, now);
            }
        }
    }

    /// End a session early, optionally counting it as viewed.
    ///
    /// Returns `false` if no session was open.
    pub async fn stop(&self, message_id: &MessageId, mark: bool) -> bool {
        let existed = self
            .sessions
            .lock()
            .remove(message_id)
            .map(|mut slot| slot.abort())
            .is_some();
        if existed && mark {
            self.complete(message_id).await;
        }
        existed
    }

    /// Motion playback reached its end.
    pub async fn playback_ended(&self, message_id: &MessageId) -> bool {
        self.stop(message_id, true).await
    }

    /// Abandon a session without consuming the message.
    pub async fn cancel(&self, message_id: &MessageId) -> bool {
        self.stop(message_id, false).await
    }

    /// Viewing progress of an open session.
    #[must_use]
    pub fn progress(&self, message_id: &MessageId) -> Option<f64> {
        let now = Instant::now();
        self.sessions
            .lock()
            .get(message_id)
            .map(|slot| slot.session.progress(now))
    }

    /// State of `message_id`'s viewing; `None` means idle.
    #[must_use]
    pub fn state(&self, message_id: &MessageId) -> Option<ViewingState> {
        if let Some(slot) = self.sessions.lock().get(message_id) {
            return Some(slot.session.state);
        }
        self.viewed
            .contains(message_id)
            .then_some(ViewingState::Completed)
    }

    /// Copy of an open session.
    #[must_use]
    pub fn session(&self, message_id: &MessageId) -> Option<ViewingSession> {
        self.sessions
            .lock()
            .get(message_id)
            .map(|slot| slot.session.clone())
    }

    /// Number of open sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Abandon every session (teardown).
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        for slot in sessions.values_mut() {
            slot.abort();
        }
        sessions.clear();
    }

    /// Pause and resume with the app lifecycle until the channel closes.
    #[must_use]
    pub fn watch_lifecycle(&self, mut rx: watch::Receiver<AppState>) -> JoinHandle<()> {
        let timer = self.me.clone();
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            if let Some(timer) = timer.upgrade()
                && initial == AppState::Background
            {
                timer.pause_all();
            }
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                let Some(timer) = timer.upgrade() else {
                    break;
                };
                match state {
                    AppState::Background => timer.pause_all(),
                    AppState::Foreground => timer.resume_all(),
                }
            }
        })
    }
}
