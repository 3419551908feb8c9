use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "KEEPSAKE_LOG";
pub const DEFAULT_FILTER: &str = "keepsake=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "keepsake.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// JSON logs on stderr. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Like [`init_logging`], with a daily rolling file under `dir` as well.
/// Logs are flushed when the returned guard is dropped.
pub fn init_logging_with_file(dir: &Path) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(dir).with_context(|| format!("create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_ansi(false)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer);

    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init_logging_with_file(&logs).unwrap();
        tracing::info!(target: "keepsake", event = "logging_test");
        drop(guard);
        assert!(logs.is_dir());
    }
}
