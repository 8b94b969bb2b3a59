//! Trailing-edge debouncing of async work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Runs only the last job scheduled per key within a quiet period.
///
/// Each [`schedule`](Self::schedule) bumps the key's generation and spawns a
/// sleeper; when the sleeper wakes it runs its job only if no newer job was
/// scheduled for the same key in the meantime.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
}

#[derive(Debug, Default)]
struct DebounceState {
    /// Monotonic across keys so a cleared key never reuses a generation.
    next_generation: u64,
    /// Latest scheduled generation per key.
    latest: HashMap<String, u64>,
}

impl Debouncer {
    /// Create a debouncer with the given quiet period.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Quiet period before a job runs.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `job` under `key`, superseding any pending job for that key.
    ///
    /// Returns `false` (and drops the job) when called outside a tokio
    /// runtime.
    pub fn schedule<F>(&self, key: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let key = key.into();
        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.latest.insert(key.clone(), generation);
            generation
        };

        let state = Arc::clone(&self.state);
        let delay = self.delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let is_latest = {
                let mut state = state.lock();
                let is_latest = state.latest.get(&key) == Some(&generation);
                if is_latest {
                    state.latest.remove(&key);
                }
                is_latest
            };
            if is_latest {
                job.await;
            }
        });
        true
    }

    /// Drop every pending job.
    pub fn cancel_all(&self) {
        self.state.lock().latest.clear();
    }

    /// Whether a job is waiting under `key`.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.state.lock().latest.contains_key(key)
    }
}
