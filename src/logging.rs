//! Tracing subscriber setup.
//!
//! `RUST_LOG` overrides the default level. Logs go to stderr in the
//! configured format; when a log directory is configured, a daily rolling
//! JSON file is written as well.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

const LOG_FILE_NAME: &str = "billing-automation.log";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init(format: LogFormat, dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr = match format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file, guard) = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer).boxed()),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

/// Test-friendly subscriber that writes through the test harness. Safe to
/// call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_log_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init(LogFormat::Json, Some(&logs), false).unwrap();
        assert!(guard.is_some());
        assert!(logs.is_dir());
        tracing::info!(account = "AUTO00-000001-000000", "log line");

        // The global subscriber is already installed now.
        assert!(init(LogFormat::Pretty, None, false).is_err());
    }
}
