use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "folio-sw.log";

/// Install the global subscriber: stderr plus a daily-rolling file in
/// `directory`. Keep the returned guard alive or buffered lines are lost.
pub fn init(config: &LogConfig, directory: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(directory).map_err(|e| {
    eyre!(
      "Failed to create log directory {}: {}",
      directory.display(),
      e
    )
  })?;

  let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(build_filter(config)?)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// RUST_LOG wins; otherwise the configured level applies to this crate and
/// dependencies stay at warn.
fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }

  EnvFilter::try_new(default_directives(&config.level))
    .map_err(|e| eyre!("Invalid log filter {}: {}", config.level, e))
}

fn default_directives(level: &str) -> String {
  if level.contains('=') || level.contains(',') {
    return level.to_string();
  }
  format!(
    "warn,{}={}",
    env!("CARGO_PKG_NAME").replace('-', "_"),
    level
  )
}
