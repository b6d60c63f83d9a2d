//! Tracing subscriber setup.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Log file prefix; the appender adds a date suffix.
const LOG_FILE_PREFIX: &str = "pm-mirror.log";

/// Install a daily-rolling file subscriber under `log_dir`.
///
/// The filter defaults to `info` and honours `RUST_LOG`. Keep the returned
/// guard alive for the process lifetime or buffered lines are lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

/// Default log directory under the platform data dir.
pub fn default_log_dir() -> Result<std::path::PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join("pm-mirror").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}
