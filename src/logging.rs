//! Logging initialisation for vmterm.
//!
//! Stderr output is always on, filtered by `RUST_LOG` or else by the
//! `[logging] level` directive. With `[logging] file = true`, or when the
//! `VMTERM_LOG` environment variable is `1`, structured logs also go to a
//! daily-rotated `vmterm.log` in the logs directory.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "vmterm.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Whether logs should also be written to a file.
pub fn file_enabled(config: &LoggingConfig) -> bool {
    config.file || std::env::var("VMTERM_LOG").as_deref() == Ok("1")
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process. `logs` is the resolved logs directory;
/// without one the file layer stays off.
pub fn init(config: &LoggingConfig, logs: Option<&Path>) -> LogGuard {
    let file_dir = logs
        .filter(|_| file_enabled(config))
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());

    let file_guard = if let Some(dir) = file_dir {
        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter(config))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter(config))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
