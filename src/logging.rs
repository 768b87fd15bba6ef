//! Logging setup: stderr, plus an optional log file.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Initialize logging.
///
/// RUST_LOG takes precedence over the configured level. Stdout is left to
/// command output. The returned guard flushes the file writer and must be
/// held until exit.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = || {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))
  };

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(filter().map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?);

  let (file_layer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (non_blocking, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter().map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
