//! Keyed, TTL-aware cache with size-bounded LRU eviction and durable
//! persistence of a configurable subset of keys.
//!
//! Every mutation is a short critical section on one lock; no lock is held
//! across an await. Fetches through [`CacheStore::get_or_fetch`] are
//! single-flight per key: concurrent callers share one in-flight future.
//!
//! Persistent keys (by prefix, see [`CacheConfig::persistent_prefixes`]) are
//! written to the [`DurableStore`] as one snapshot, debounced after every
//! write, and restored at startup with their original timestamps. When the
//! store fails, the cache logs the error and keeps working memory-only for
//! the rest of the session.

pub mod entry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use glimpse_proto::codec::{self, CodecError};
use glimpse_proto::message::Timestamp;

use crate::backend::BackendError;
use crate::clock::{self, Clock};
use crate::config::CacheConfig;
use crate::debounce::Debouncer;
use crate::storage::{DurableStore, StorageError};

pub use entry::{
    CacheEntry, CachePattern, CacheValue, conversations_key, messages_key, owner_messages_prefix,
};

/// Durable key holding the cache snapshot.
pub const CACHE_SNAPSHOT_KEY: &str = "glimpse.cache.v1";

/// Snapshot format version.
const SNAPSHOT_VERSION: u8 = 2;

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The producer of a `get_or_fetch` failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] BackendError),

    /// The durable store failed; the cache is now memory-only.
    #[error("cache persistence failed: {0}")]
    Storage(#[from] StorageError),

    /// The persisted snapshot could not be encoded or decoded.
    #[error("cache snapshot codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Hit/miss counters and occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries dropped by the size budget.
    pub evictions: u64,
    /// Entries currently held.
    pub entries: usize,
    /// Aggregate estimated size of held entries.
    pub total_bytes: usize,
}

type SharedFetch = Shared<BoxFuture<'static, Result<CacheValue, BackendError>>>;

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    total_bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) -> Option<&mut Slot> {
        self.tick += 1;
        let tick = self.tick;
        self.slots.get_mut(key).map(|slot| {
            slot.last_access = tick;
            slot
        })
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.tick += 1;
        self.total_bytes += entry.size_bytes;
        let slot = Slot {
            entry,
            last_access: self.tick,
        };
        if let Some(old) = self.slots.insert(key, slot) {
            self.total_bytes = self.total_bytes.saturating_sub(old.entry.size_bytes);
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot)
    }

    /// Drop least-recently-accessed entries until under `budget`, never
    /// touching `keep`. Returns the removed keys.
    fn evict_to(&mut self, budget: usize, keep: Option<&str>) -> Vec<String> {
        let mut removed = Vec::new();
        while self.total_bytes > budget {
            let victim = self
                .slots
                .iter()
                .filter(|(k, _)| Some(k.as_str()) != keep)
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                break;
            };
            self.remove(&victim);
            self.evictions += 1;
            removed.push(victim);
        }
        removed
    }
}

/// The cache store. Construct with [`CacheStore::new`]; shared as `Arc`.
pub struct CacheStore<S: DurableStore> {
    config: CacheConfig,
    store: Arc<S>,
    clock: Clock,
    state: Mutex<CacheState>,
    inflight: Mutex<HashMap<String, SharedFetch>>,
    flusher: Debouncer,
    memory_only: AtomicBool,
    me: Weak<Self>,
}

impl<S: DurableStore> std::fmt::Debug for CacheStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("stats", &self.stats())
            .field("memory_only", &self.is_memory_only())
            .finish_non_exhaustive()
    }
}

impl<S: DurableStore> CacheStore<S> {
    /// Create a cache persisting into `store`, using the system clock.
    #[must_use]
    pub fn new(config: CacheConfig, store: Arc<S>) -> Arc<Self> {
        Self::with_clock(config, store, clock::system())
    }

    /// Create a cache with an explicit clock.
    #[must_use]
    pub fn with_clock(config: CacheConfig, store: Arc<S>, clock: Clock) -> Arc<Self> {
        let flusher = Debouncer::new(config.persist_debounce);
        Arc::new_cyclic(|me| Self {
            config,
            store,
            clock,
            state: Mutex::new(CacheState::default()),
            inflight: Mutex::new(HashMap::new()),
            flusher,
            memory_only: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Current time according to the cache's clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    /// Whether `key` is written to durable storage.
    #[must_use]
    pub fn is_persistent(&self, key: &str) -> bool {
        self.config
            .persistent_prefixes
            .iter()
            .any(|p| key.starts_with(p.as_str()))
    }

    /// Fresh value under `key`.
    ///
    /// A stale entry is a miss. Stale non-persistent entries are dropped;
    /// stale persistent entries stay so [`peek`](Self::peek) and
    /// [`get_or_fetch`](Self::get_or_fetch) can serve them while
    /// revalidating.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let now = self.now();
        let persistent = self.is_persistent(key);
        let mut state = self.state.lock();
        let lookup = state
            .touch(key)
            .map(|slot| slot.entry.is_fresh(now, None).then(|| slot.entry.value.clone()));
        let fresh = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                if !persistent {
                    state.remove(key);
                }
                None
            }
            None => None,
        };
        if fresh.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        fresh
    }

    /// Value under `key` regardless of freshness.
    pub fn peek(&self, key: &str) -> Option<CacheValue> {
        let mut state = self.state.lock();
        let value = state.touch(key).map(|slot| slot.entry.value.clone());
        if value.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        value
    }

    /// Whether an entry exists under `key`, fresh or not.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// Store `value` with the default TTL.
    pub fn set(&self, key: &str, value: CacheValue) {
        self.set_with_ttl(key, value, self.config.default_ttl);
    }

    /// Store `value` with an explicit TTL.
    pub fn set_with_ttl(&self, key: &str, value: CacheValue, ttl: Duration) {
        let entry = CacheEntry::new(value, self.now(), ttl);
        let evicted = {
            let mut state = self.state.lock();
            state.insert(key.to_string(), entry);
            state.evict_to(self.config.max_bytes, Some(key))
        };
        for victim in &evicted {
            tracing::debug!(key = %victim, "evicted cache entry");
        }
        if self.is_persistent(key) || evicted.iter().any(|k| self.is_persistent(k)) {
            self.schedule_flush();
        }
    }

    /// Whether `key` holds a value younger than `ttl` (or its own TTL).
    #[must_use]
    pub fn is_fresh(&self, key: &str, ttl: Option<Duration>) -> bool {
        let now = self.now();
        self.state
            .lock()
            .slots
            .get(key)
            .is_some_and(|slot| slot.entry.is_fresh(now, ttl))
    }

    /// Time since `key` was stored.
    #[must_use]
    pub fn age(&self, key: &str) -> Option<Duration> {
        let now = self.now();
        self.state
            .lock()
            .slots
            .get(key)
            .map(|slot| slot.entry.age(now))
    }

    /// Return the cached value, or run `producer` once for all concurrent
    /// callers and cache its result.
    ///
    /// A stale persistent entry is returned immediately and refreshed in
    /// the background.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Fetch`] if the producer fails; nothing is
    /// cached in that case.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<CacheValue, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, BackendError>> + Send + 'static,
    {
        let now = self.now();
        let persistent = self.is_persistent(key);
        let cached = {
            let mut state = self.state.lock();
            let found = state
                .touch(key)
                .map(|slot| (slot.entry.value.clone(), slot.entry.is_fresh(now, ttl)));
            match found {
                Some((value, true)) => {
                    state.hits += 1;
                    Some((value, true))
                }
                Some((value, false)) if persistent => {
                    state.hits += 1;
                    Some((value, false))
                }
                Some(_) => {
                    state.remove(key);
                    state.misses += 1;
                    None
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        };

        match cached {
            Some((value, true)) => Ok(value),
            Some((value, false)) => {
                let refresh = self.join_fetch(key, ttl, producer);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    tracing::debug!(key, "serving stale entry while revalidating");
                    handle.spawn(async move {
                        let _ = refresh.await;
                    });
                }
                Ok(value)
            }
            None => Ok(self.join_fetch(key, ttl, producer).await?),
        }
    }

    fn join_fetch<F, Fut>(&self, key: &str, ttl: Option<Duration>, producer: F) -> SharedFetch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, BackendError>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            tracing::trace!(key, "joining in-flight fetch");
            return existing.clone();
        }

        let fetch = producer();
        let cache = self.me.clone();
        let owned_key = key.to_string();
        let shared = async move {
            let result = fetch.await;
            if let Some(cache) = cache.upgrade() {
                cache.inflight.lock().remove(&owned_key);
                match &result {
                    Ok(value) => {
                        let ttl = ttl.unwrap_or(cache.config.default_ttl);
                        cache.set_with_ttl(&owned_key, value.clone(), ttl);
                    }
                    Err(e) => {
                        tracing::warn!(key = %owned_key, error = %e, "cache fetch failed");
                    }
                }
            }
            result
        }
        .boxed()
        .shared();
        inflight.insert(key.to_string(), shared.clone());
        shared
    }

    /// Targeted read-modify-write of one entry.
    ///
    /// Returns `None` if `key` is absent. The entry keeps its original
    /// timestamp: a patch does not make a partially known value fresh.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut CacheValue) -> R) -> Option<R> {
        let result = {
            let mut state = self.state.lock();
            let slot = state.touch(key)?;
            let result = f(&mut slot.entry.value);
            let new_size = slot.entry.value.estimated_size();
            let old_size = std::mem::replace(&mut slot.entry.size_bytes, new_size);
            state.total_bytes = state.total_bytes.saturating_sub(old_size) + new_size;
            state.evict_to(self.config.max_bytes, Some(key));
            result
        };
        if self.is_persistent(key) {
            self.schedule_flush();
        }
        Some(result)
    }

    /// Atomically replace `key` with `f(current)` and stamp it fresh.
    ///
    /// Used when a fetch result must be combined with whatever realtime
    /// edits landed while the fetch was in flight.
    pub fn upsert(&self, key: &str, f: impl FnOnce(Option<CacheValue>) -> CacheValue) {
        let now = self.now();
        let ttl = self.config.default_ttl;
        let evicted = {
            let mut state = self.state.lock();
            let current = state.remove(key).map(|slot| slot.entry.value);
            state.insert(key.to_string(), CacheEntry::new(f(current), now, ttl));
            state.evict_to(self.config.max_bytes, Some(key))
        };
        if self.is_persistent(key) || evicted.iter().any(|k| self.is_persistent(k)) {
            self.schedule_flush();
        }
    }

    /// Drop one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed && self.is_persistent(key) {
            self.schedule_flush();
        }
        removed
    }

    /// Drop every entry selected by `pattern`. Returns how many were dropped.
    pub fn invalidate(&self, pattern: &CachePattern) -> usize {
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .slots
                .keys()
                .filter(|k| pattern.matches(k))
                .cloned()
                .collect();
            for key in &keys {
                state.remove(key);
            }
            keys
        };
        if !removed.is_empty() {
            tracing::debug!(%pattern, count = removed.len(), "invalidated cache entries");
        }
        if removed.iter().any(|k| self.is_persistent(k)) {
            self.schedule_flush();
        }
        removed.len()
    }

    /// Enforce the size budget now. Returns how many entries were dropped.
    pub fn evict(&self) -> usize {
        let evicted = self.state.lock().evict_to(self.config.max_bytes, None);
        if evicted.iter().any(|k| self.is_persistent(k)) {
            self.schedule_flush();
        }
        evicted.len()
    }

    /// Drop everything, including in-flight fetch bookkeeping.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.slots.clear();
            state.total_bytes = 0;
        }
        self.inflight.lock().clear();
        self.schedule_flush();
    }

    /// Keys currently held, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Counters and occupancy.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entries: state.slots.len(),
            total_bytes: state.total_bytes,
        }
    }

    /// Whether persistence has been disabled after a storage failure.
    #[must_use]
    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::SeqCst)
    }

    fn schedule_flush(&self) {
        if self.is_memory_only() {
            return;
        }
        let cache = self.me.clone();
        self.flusher.schedule("flush", async move {
            if let Some(cache) = cache.upgrade() {
                // Errors are logged and switch the cache to memory-only.
                let _ = cache.flush().await;
            }
        });
    }

    /// Write every persistent entry to durable storage now.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] (and switches to memory-only) if the
    /// store rejects the write, or [`CacheError::Codec`] if encoding fails.
    pub async fn flush(&self) -> Result<(), CacheError> {
        if self.is_memory_only() {
            return Ok(());
        }
        let mut snapshot: Vec<(String, CacheEntry)> = {
            let state = self.state.lock();
            state
                .slots
                .iter()
                .filter(|(k, _)| self.is_persistent(k))
                .map(|(k, slot)| (k.clone(), slot.entry.clone()))
                .collect()
        };
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let bytes = codec::encode_snapshot(SNAPSHOT_VERSION, &snapshot)?;
        if let Err(e) = self.store.set(CACHE_SNAPSHOT_KEY, bytes).await {
            self.memory_only.store(true, Ordering::SeqCst);
            tracing::warn!(error = %e, "cache persistence failed, continuing memory-only");
            return Err(e.into());
        }
        tracing::trace!(entries = snapshot.len(), "cache snapshot flushed");
        Ok(())
    }

    /// Load persisted entries, keeping their original timestamps.
    ///
    /// Entries already present in memory win over restored ones. Returns
    /// how many entries were restored.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`] (and switches to memory-only) if the
    /// store cannot be read, or [`CacheError::Codec`] if the snapshot is
    /// corrupt or from another format version.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let bytes = match self.store.get(CACHE_SNAPSHOT_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(0),
            Err(e) => {
                self.memory_only.store(true, Ordering::SeqCst);
                tracing::warn!(error = %e, "cache restore failed, continuing memory-only");
                return Err(e.into());
            }
        };
        let snapshot: Vec<(String, CacheEntry)> =
            codec::decode_snapshot(SNAPSHOT_VERSION, &bytes).inspect_err(|e| {
                tracing::warn!(error = %e, "discarding unreadable cache snapshot");
            })?;

        let restored = {
            let mut state = self.state.lock();
            let mut restored = 0;
            for (key, entry) in snapshot {
                if !self.is_persistent(&key) || state.slots.contains_key(&key) {
                    continue;
                }
                state.insert(key, entry);
                restored += 1;
            }
            state.evict_to(self.config.max_bytes, None);
            restored
        };
        tracing::debug!(restored, "cache restored from durable storage");
        Ok(restored)
    }
}
