//! Tracing subscriber setup for the CLI and the worker.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogFormat;

/// Filter from `RUST_LOG`, or `info` (`debug` when verbose) for this crate.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "review_pulse={level},tower=warn,hyper=warn,reqwest=warn"
        ))
    })
}

/// Console-only logging for short-lived CLI commands. Writes to stderr so
/// command output on stdout stays clean.
pub fn init_cli(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Console plus a daily-rolling JSON file in `log_dir`. Keep the returned
/// guard alive for the life of the process or buffered lines are lost.
pub fn init_worker(verbose: bool, format: LogFormat, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, "worker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false);

    let registry = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(file_layer);

    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_worker_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("data").join("logs");
        let _guard = init_worker(false, LogFormat::Json, &logs).unwrap();
        assert!(logs.is_dir());
    }

    #[test]
    fn test_init_cli_twice_is_harmless() {
        init_cli(false);
        init_cli(true);
    }
}
