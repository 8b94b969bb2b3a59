//! Durable, monotonic set of consumed ephemeral message ids.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use glimpse_proto::codec::{self, CodecError};
use glimpse_proto::message::{Message, MessageId};

use crate::storage::{DurableStore, StorageError};

/// Durable key holding the viewed set.
pub const VIEWED_KEY: &str = "glimpse.viewed.v1";

const SNAPSHOT_VERSION: u8 = 1;

/// Errors from viewed-set persistence.
#[derive(Debug, thiserror::Error)]
pub enum ViewedError {
    /// The durable store failed.
    #[error("viewed set storage error: {0}")]
    Storage(#[from] StorageError),

    /// The persisted set could not be decoded.
    #[error("viewed set codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Ids of ephemeral messages the user has consumed.
///
/// Ids are only ever added; the set is emptied only by [`reset`](Self::reset).
/// A failed write keeps the id in memory, so the message stays hidden for
/// the session even when storage is unavailable.
pub struct ViewedSet<S: DurableStore> {
    ids: Mutex<HashSet<MessageId>>,
    store: Arc<S>,
    /// Serializes snapshot writes so a later write always carries every id.
    write_lock: tokio::sync::Mutex<()>,
}

impl<S: DurableStore> std::fmt::Debug for ViewedSet<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewedSet")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<S: DurableStore> ViewedSet<S> {
    /// Create an empty set persisting into `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load persisted ids, unioned with any already in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ViewedError`] if storage cannot be read or the snapshot is
    /// corrupt.
    pub async fn restore(&self) -> Result<usize, ViewedError> {
        let Some(bytes) = self.store.get(VIEWED_KEY).await? else {
            return Ok(0);
        };
        let ids: Vec<MessageId> = codec::decode_snapshot(SNAPSHOT_VERSION, &bytes)?;
        let count = ids.len();
        self.ids.lock().extend(ids);
        tracing::debug!(count, "viewed set restored");
        Ok(count)
    }

    /// Whether `id` was consumed.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.lock().contains(id)
    }

    /// Whether `msg` was consumed under its server id or its temp id.
    #[must_use]
    pub fn contains_message(&self, msg: &Message) -> bool {
        let ids = self.ids.lock();
        [&msg.id, &msg.temp_id]
            .into_iter()
            .flatten()
            .any(|id| ids.contains(id))
    }

    /// Number of consumed ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Whether nothing was consumed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Record `id` as consumed and persist. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns [`ViewedError::Storage`] if the write fails; the id stays in
    /// memory regardless.
    pub async fn mark(&self, id: &MessageId) -> Result<bool, ViewedError> {
        if !self.ids.lock().insert(id.clone()) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    /// Write the current set to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`ViewedError`] if encoding or the write fails.
    pub async fn persist(&self) -> Result<(), ViewedError> {
        let _guard = self.write_lock.lock().await;
        let mut ids: Vec<MessageId> = self.ids.lock().iter().cloned().collect();
        ids.sort();
        let bytes = codec::encode_snapshot(SNAPSHOT_VERSION, &ids)?;
        self.store.set(VIEWED_KEY, bytes).await.inspect_err(|e| {
            tracing::warn!(error = %e, "failed to persist viewed set");
        })?;
        Ok(())
    }

    /// Forget every consumed id, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ViewedError::Storage`] if the durable copy cannot be removed.
    pub async fn reset(&self) -> Result<(), ViewedError> {
        let _guard = self.write_lock.lock().await;
        self.ids.lock().clear();
        self.store.remove(VIEWED_KEY).await?;
        Ok(())
    }
}
