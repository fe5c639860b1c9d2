//! Tracing subscriber setup for services embedding the engine.
//!
//! Reads `RUST_LOG` (filter, default `info`) and `LIMIT_LOG_DIR`. When the directory is set,
//! events go to a daily-rotated file there (plain text, no ANSI); otherwise to stderr.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Directory for rotated log files.
pub const ENV_LOG_DIR: &str = "LIMIT_LOG_DIR";

/// Keep the guard alive for the lifetime of the process; dropping it flushes and stops the
/// background file writer.
pub struct LogGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. Returns an error if one is already installed.
pub fn init(file_prefix: &str) -> Result<LogGuard, Box<dyn std::error::Error + Send + Sync>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(file_layer).try_init()?;
            tracing::info!(dir = %dir.trim(), "limit logging to file");
            Ok(LogGuard { _file: Some(guard) })
        }
        _ => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter);
            tracing_subscriber::registry().with(stderr_layer).try_init()?;
            Ok(LogGuard { _file: None })
        }
    }
}
