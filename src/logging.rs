//! Logging setup: stderr plus an optional log file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging. `RUST_LOG` controls the level (default "info").
///
/// With `log_file` set, everything is also written there without ANSI
/// colors. Keep the returned guard alive until exit so buffered lines are
/// flushed.
pub fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
  let (file_layer, guard) = match log_file {
    Some(path) => {
      let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "offgrid.log".into());

      let appender = tracing_appender::rolling::never(directory, file_name);
      let (non_blocking, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(env_filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter()),
    )
    .with(file_layer)
    .init();

  guard
}
