//! Configuration for the sync core.
//!
//! Values are resolved with the following priority (highest first):
//! 1. TOML config file (explicit path, or `~/.config/glimpse/config.toml`)
//! 2. Compiled defaults
//!
//! Missing default config file is not an error (defaults are used). An
//! explicit path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    cache: CacheFileConfig,
    window: WindowFileConfig,
    outbox: OutboxFileConfig,
    ephemeral: EphemeralFileConfig,
    events: EventsFileConfig,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    max_bytes: Option<usize>,
    default_ttl_secs: Option<u64>,
    persist_debounce_ms: Option<u64>,
    persistent_prefixes: Option<Vec<String>>,
}

/// `[window]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct WindowFileConfig {
    size: Option<usize>,
    max_backfill_pages: Option<usize>,
    oversample: Option<usize>,
    stale_after_secs: Option<u64>,
}

/// `[outbox]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OutboxFileConfig {
    max_retries: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

/// `[ephemeral]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EphemeralFileConfig {
    static_duration_ms: Option<u64>,
    motion_buffer_ms: Option<u64>,
    default_motion_duration_ms: Option<u64>,
}

/// `[events]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EventsFileConfig {
    refresh_debounce_ms: Option<u64>,
    max_listeners_per_event: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Cache store settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Aggregate estimated size budget before LRU eviction kicks in.
    pub max_bytes: usize,
    /// TTL applied by [`CacheStore::set`](crate::cache::CacheStore::set).
    pub default_ttl: Duration,
    /// Quiet period before dirty persistent keys are flushed.
    pub persist_debounce: Duration,
    /// Key prefixes that are persisted to durable storage.
    pub persistent_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            persist_debounce: Duration::from_millis(1_000),
            persistent_prefixes: vec!["conversations:".to_string(), "messages:".to_string()],
        }
    }
}

/// Sliding-window projector settings.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Number of messages shown per conversation.
    pub size: usize,
    /// Maximum extra pages fetched when filtering shrinks the window.
    pub max_backfill_pages: usize,
    /// Page size multiplier applied to `size` when fetching.
    pub oversample: usize,
    /// Age after which a cached window is refreshed in the background.
    pub stale_after: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 10,
            max_backfill_pages: 4,
            oversample: 2,
            stale_after: Duration::from_secs(2 * 60),
        }
    }
}

/// Optimistic send queue settings.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Attempts after the first before an item is marked failed.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on every further retry.
    pub base_backoff: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Ephemeral viewing timer settings.
#[derive(Debug, Clone)]
pub struct EphemeralConfig {
    /// Viewing time for still images.
    pub static_duration: Duration,
    /// Extra time added to motion media before the fallback timer fires.
    pub motion_buffer: Duration,
    /// Assumed motion duration until the real one is known.
    pub default_motion_duration: Duration,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            static_duration: Duration::from_secs(5),
            motion_buffer: Duration::from_secs(2),
            default_motion_duration: Duration::from_secs(10),
        }
    }
}

/// Event bus and realtime settings.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Window in which realtime-triggered refreshes are coalesced.
    pub refresh_debounce: Duration,
    /// Listener count per event kind above which a leak warning is logged.
    pub max_listeners_per_event: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            refresh_debounce: Duration::from_millis(300),
            max_listeners_per_event: 10,
        }
    }
}

/// Fully resolved sync core configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Cache store settings.
    pub cache: CacheConfig,
    /// Window projector settings.
    pub window: WindowConfig,
    /// Send queue settings.
    pub outbox: OutboxConfig,
    /// Viewing timer settings.
    pub ephemeral: EphemeralConfig,
    /// Event bus settings.
    pub events: EventConfig,
}

impl SyncConfig {
    /// Load configuration from a TOML file layered over the defaults.
    ///
    /// If `explicit_path` is given and the file does not exist, returns an
    /// error. Otherwise the default path
    /// (`~/.config/glimpse/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = load_config_file(explicit_path)?;
        Ok(Self::resolve(&file))
    }

    /// Parse configuration from a TOML string layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseToml`] if the string is not valid TOML
    /// for this schema.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        Ok(Self::resolve(&file))
    }

    /// Resolve a `SyncConfig` from a parsed config file.
    ///
    /// Priority: file > default.
    #[must_use]
    fn resolve(file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            cache: CacheConfig {
                max_bytes: file.cache.max_bytes.unwrap_or(defaults.cache.max_bytes),
                default_ttl: file
                    .cache
                    .default_ttl_secs
                    .map_or(defaults.cache.default_ttl, Duration::from_secs),
                persist_debounce: file
                    .cache
                    .persist_debounce_ms
                    .map_or(defaults.cache.persist_debounce, Duration::from_millis),
                persistent_prefixes: file
                    .cache
                    .persistent_prefixes
                    .clone()
                    .unwrap_or(defaults.cache.persistent_prefixes),
            },
            window: WindowConfig {
                size: file.window.size.unwrap_or(defaults.window.size).max(1),
                max_backfill_pages: file
                    .window
                    .max_backfill_pages
                    .unwrap_or(defaults.window.max_backfill_pages),
                oversample: file
                    .window
                    .oversample
                    .unwrap_or(defaults.window.oversample)
                    .max(1),
                stale_after: file
                    .window
                    .stale_after_secs
                    .map_or(defaults.window.stale_after, Duration::from_secs),
            },
            outbox: OutboxConfig {
                max_retries: file
                    .outbox
                    .max_retries
                    .unwrap_or(defaults.outbox.max_retries),
                base_backoff: file
                    .outbox
                    .base_backoff_ms
                    .map_or(defaults.outbox.base_backoff, Duration::from_millis),
                max_backoff: file
                    .outbox
                    .max_backoff_ms
                    .map_or(defaults.outbox.max_backoff, Duration::from_millis),
            },
            ephemeral: EphemeralConfig {
                static_duration: file
                    .ephemeral
                    .static_duration_ms
                    .map_or(defaults.ephemeral.static_duration, Duration::from_millis),
                motion_buffer: file
                    .ephemeral
                    .motion_buffer_ms
                    .map_or(defaults.ephemeral.motion_buffer, Duration::from_millis),
                default_motion_duration: file
                    .ephemeral
                    .default_motion_duration_ms
                    .map_or(defaults.ephemeral.default_motion_duration, Duration::from_millis),
            },
            events: EventConfig {
                refresh_debounce: file
                    .events
                    .refresh_debounce_ms
                    .map_or(defaults.events.refresh_debounce, Duration::from_millis),
                max_listeners_per_event: file
                    .events
                    .max_listeners_per_event
                    .unwrap_or(defaults.events.max_listeners_per_event),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("glimpse").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
