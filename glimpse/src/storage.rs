//! Durable key-value storage for cache snapshots, the outbox, and the
//! viewed set.
//!
//! Defines the [`DurableStore`] trait plus two implementations:
//! - [`MemoryStore`]: in-process map, with write-failure injection for tests
//! - [`FileStore`]: one file per key under a base directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Errors that can occur during durable storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing medium is unavailable (disk full, quota exceeded, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An I/O operation on a key failed.
    #[error("storage I/O error for key {key}: {source}")]
    Io {
        /// Key being read or written.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Async byte-oriented key-value store.
///
/// Values are opaque; callers encode them with
/// [`glimpse_proto::codec::encode_snapshot`]. A missing key is `Ok(None)`,
/// never an error. Removing a missing key succeeds.
pub trait DurableStore: Send + Sync + 'static {
    /// Read the value stored under `key`.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Delete `key`.
    fn remove(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}

/// In-memory [`DurableStore`].
///
/// Survives for the lifetime of the value, which makes it a stand-in for
/// platform storage in tests and host prototypes. Writes can be made to
/// fail with [`set_failing`](Self::set_failing).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` (or stop making it) return
    /// [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether `key` has a stored value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".into()));
        }
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// File-backed [`DurableStore`]: one file per key.
///
/// Key characters that are not safe in file names are replaced with `_`.
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|source| StorageError::Io {
                key: base_path.display().to_string(),
                source,
            })?;
        Ok(Self { base_path })
    }

    /// Directory holding the value files.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let sanitized = key.replace(['/', '\\', ':'], "_");
        self.base_path.join(format!("{sanitized}.bin"))
    }
}

impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.key_to_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.key_to_path(key);
        let tmp = path.with_extension("bin.tmp");
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::write(&tmp, value).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
