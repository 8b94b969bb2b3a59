//! The single worker draining a [`SendQueue`].
//!
//! Pipeline per item: upload media (once) -> create the message -> merge
//! the server record over the placeholder. Results are applied only while
//! the queue's session is live.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use glimpse_proto::message::{Message, MessageId};

use crate::backend::{BackendError, MediaPipeline, MessageBackend};
use crate::bus::SyncEvent;
use crate::cache::{CacheValue, messages_key};
use crate::config::OutboxConfig;
use crate::merge;
use crate::storage::DurableStore;

use super::{PendingSend, QueueState, SendQueue, SendState};

/// Delay before retry number `retries` (1-based): doubling from the base,
/// plus `jitter`, capped at the maximum.
#[must_use]
pub fn backoff_delay(config: &OutboxConfig, retries: u32, jitter: Duration) -> Duration {
    let exponent = retries.saturating_sub(1).min(16);
    config
        .base_backoff
        .saturating_mul(1 << exponent)
        .saturating_add(jitter)
        .min(config.max_backoff)
}

enum Next {
    Process(MessageId),
    WaitUntil(Instant),
    Idle,
}

impl QueueState {
    /// First queued item whose backoff has elapsed, taken off the queue.
    fn next(&mut self, now: Instant) -> Next {
        if self.paused {
            return Next::Idle;
        }
        let mut earliest: Option<Instant> = None;
        let mut ready = None;
        for (pos, id) in self.order.iter().enumerate() {
            match self.ready_at.get(id) {
                Some(at) if *at > now => {
                    earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
                }
                _ => {
                    ready = Some(pos);
                    break;
                }
            }
        }
        if let Some(id) = ready.and_then(|pos| self.order.remove(pos)) {
            self.ready_at.remove(&id);
            return Next::Process(id);
        }
        earliest.map_or(Next::Idle, Next::WaitUntil)
    }
}

impl<B: MessageBackend, M: MediaPipeline, S: DurableStore> SendQueue<B, M, S> {
    /// Start the worker, or wake it if it is already running.
    pub(super) fn kick(&self) {
        let start = {
            let mut state = self.state.lock();
            if state.worker_running || state.paused || state.order.is_empty() {
                false
            } else {
                state.worker_running = true;
                true
            }
        };
        if !start {
            self.wake.notify_one();
            return;
        }
        let spawned = match (self.me.upgrade(), tokio::runtime::Handle::try_current()) {
            (Some(queue), Ok(handle)) => {
                handle.spawn(queue.run());
                true
            }
            _ => false,
        };
        if !spawned {
            tracing::warn!("no runtime, send worker not started");
            self.state.lock().worker_running = false;
        }
    }

    async fn run(self: Arc<Self>) {
        tracing::debug!(owner = %self.owner, "send worker started");
        loop {
            if !self.is_live() {
                self.state.lock().worker_running = false;
                break;
            }
            let next = {
                let mut state = self.state.lock();
                let next = state.next(Instant::now());
                if matches!(next, Next::Idle) {
                    state.worker_running = false;
                }
                next
            };
            match next {
                Next::Idle => break,
                Next::WaitUntil(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = self.wake.notified() => {}
                    }
                }
                Next::Process(temp_id) => self.process(&temp_id).await,
            }
        }
        tracing::debug!(owner = %self.owner, "send worker idle");
    }

    async fn process(&self, temp_id: &MessageId) {
        let Some(item) = self.state.lock().items.get(temp_id).cloned() else {
            return;
        };
        let result = self.attempt(&item).await;
        if !self.is_live() {
            tracing::debug!(temp_id = %temp_id, "session ended, discarding send result");
            return;
        }
        match result {
            Ok(mut created) => {
                created.temp_id.get_or_insert_with(|| temp_id.clone());
                self.complete(&item, created);
            }
            Err(e) => self.fail_attempt(temp_id, &e),
        }
        self.persist_logged().await;
    }

    async fn attempt(&self, item: &PendingSend) -> Result<Message, BackendError> {
        let media = match (&item.uploaded, &item.local_media) {
            (Some(uploaded), _) => Some(uploaded.clone()),
            (None, Some(local)) => {
                self.transition(&item.temp_id, SendState::Uploading);
                let uploaded = self.media.upload(local).await?;
                if let Some(current) = self.state.lock().items.get_mut(&item.temp_id) {
                    current.uploaded = Some(uploaded.clone());
                }
                Some(uploaded)
            }
            (None, None) => None,
        };

        self.transition(&item.temp_id, SendState::Sending);
        let mut draft = item.placeholder.clone();
        draft.media = media;
        self.backend.create_message(&draft).await
    }

    fn transition(&self, temp_id: &MessageId, state: SendState) {
        let retries = {
            let mut queue = self.state.lock();
            let Some(item) = queue.items.get_mut(temp_id) else {
                return;
            };
            item.state = state;
            item.retries
        };
        self.emit_status(temp_id, state, retries, None);
    }

    fn complete(&self, item: &PendingSend, created: Message) {
        self.state.lock().items.remove(&item.temp_id);

        let key = messages_key(&self.owner, &item.peer_id);
        let merged = self.cache.update(&key, |value| {
            if let CacheValue::Messages(list) = value {
                merge::merge_into(list, [created.clone()]);
            }
        });
        if merged.is_none() {
            self.cache
                .set(&key, CacheValue::Messages(vec![created.clone()]));
        }

        tracing::info!(
            temp_id = %item.temp_id,
            id = ?created.id,
            retries = item.retries,
            "message sent"
        );
        self.emit_status(&item.temp_id, SendState::Sent, item.retries, None);
        self.bus.emit(SyncEvent::OptimisticReplaced {
            temp_id: item.temp_id.clone(),
            message: created.clone(),
        });
        self.bus.emit(SyncEvent::MessageSent { message: created });
    }

    fn fail_attempt(&self, temp_id: &MessageId, error: &BackendError) {
        let now = Instant::now();
        let outcome = {
            let mut state = self.state.lock();
            let Some(item) = state.items.get_mut(temp_id) else {
                return;
            };
            item.retries += 1;
            item.last_error = Some(error.to_string());
            let retries = item.retries;
            let give_up = !error.is_retryable() || retries >= self.config.max_retries;
            if give_up {
                item.state = SendState::Failed;
                item.placeholder.flags.sending = false;
                item.placeholder.flags.failed = true;
                Some((retries, Some(item.peer_id.clone())))
            } else {
                item.state = SendState::Queued;
                let jitter_ceiling =
                    u64::try_from(self.config.base_backoff.as_millis() / 4).unwrap_or(0);
                let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ceiling));
                let delay = backoff_delay(&self.config, retries, jitter);
                state.ready_at.insert(temp_id.clone(), now + delay);
                state.order.push_back(temp_id.clone());
                tracing::debug!(
                    temp_id = %temp_id,
                    retries,
                    ?delay,
                    error = %error,
                    "send failed, will retry"
                );
                Some((retries, None))
            }
        };
        let Some((retries, failed_peer)) = outcome else {
            return;
        };

        match failed_peer {
            Some(peer) => {
                let key = messages_key(&self.owner, &peer);
                self.cache.update(&key, |value| {
                    if let CacheValue::Messages(list) = value {
                        for msg in list
                            .iter_mut()
                            .filter(|m| m.is_optimistic() && m.has_identity(temp_id))
                        {
                            msg.flags.sending = false;
                            msg.flags.failed = true;
                        }
                    }
                });
                tracing::warn!(
                    temp_id = %temp_id,
                    retries,
                    error = %error,
                    "send failed permanently"
                );
                self.emit_status(temp_id, SendState::Failed, retries, Some(error.to_string()));
            }
            None => {
                self.emit_status(temp_id, SendState::Queued, retries, Some(error.to_string()));
            }
        }
    }
}
