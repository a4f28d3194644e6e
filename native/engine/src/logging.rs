use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Default filter when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "debug";

/// Installs the global subscriber: a daily rolling file in `logs_dir` at debug level, plus
/// compact stderr output filtered to `console_level`.
///
/// The returned guard flushes the file writer on drop and must be held until exit.
pub fn setup_logging(logs_dir: &Path, console_level: tracing::Level) -> Result<WorkerGuard> {
    fs_err::create_dir_all(logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("abx")
        .filename_suffix("log")
        .build(logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_filter(file_filter);
    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::from_level(console_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_logs_dir_and_rejects_second_init() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let first = setup_logging(&logs, tracing::Level::WARN);
        assert!(logs.is_dir());
        if first.is_ok() {
            assert!(setup_logging(&logs, tracing::Level::WARN).is_err());
        }
    }
}
