//! Log output for the command-line tool.
//!
//! Events go to stderr and to `<log_dir>/ers-offline.log`. The filter
//! defaults to `info` and follows `RUST_LOG` when set.

use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "ers-offline.log";

/// Keeps the file writer alive; dropping it flushes the log.
pub struct LoggingGuard {
  _file_guard: WorkerGuard,
}

/// Log directory under the data directory.
pub fn default_log_dir(data_dir: &Path) -> PathBuf {
  data_dir.join("logs")
}

fn env_filter(verbose: bool) -> EnvFilter {
  let default = if verbose { "debug" } else { "info" };
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Call once.
pub fn init_logging(log_dir: &Path, verbose: bool) -> Result<LoggingGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
  let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(non_blocking_file)
    .with_ansi(false);

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(io::stderr)
    .with_target(false)
    .compact();

  tracing_subscriber::registry()
    .with(env_filter(verbose))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}
