//! Tracing subscriber setup for hosts embedding the sync core.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

/// Default log file name, placed in the system temp directory.
pub const DEFAULT_LOG_FILE: &str = "glimpse.log";

/// Initialize file-based logging.
///
/// Logs are written to `file_path` (or `$TMPDIR/glimpse.log`) through a
/// non-blocking writer. `RUST_LOG` overrides `level` when set.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed. Returns `None` if the path has no
/// parent or file name, or if a global subscriber is already installed.
#[must_use]
pub fn init(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join(DEFAULT_LOG_FILE);
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
