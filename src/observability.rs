// SPDX-License-Identifier: Apache-2.0

//! Logging and observability helpers.

pub mod sensitive;

pub use sensitive::{redact_uri, Sensitive};

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogHandler, LoggingConfig};

const LOG_FILE_PREFIX: &str = "indexer.log";
const LOG_RETENTION_DAYS: u64 = 14;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` overrides the level derived from `config.debug`. Calling this
/// twice keeps the first subscriber.
pub fn init_tracing(config: &LoggingConfig) -> io::Result<()> {
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    if let Some(log_dir) = &config.log_dir {
        fs::create_dir_all(log_dir)?;
        if let Err(e) = cleanup_old_logs(log_dir, LOG_RETENTION_DAYS) {
            eprintln!("Failed to clean up old logs: {}", e);
        }
        let file_appender: RollingFileAppender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .json()
                .with_thread_ids(true)
                .with_file(config.enable_caller)
                .with_line_number(config.enable_caller)
                .with_current_span(true)
                .with_span_list(true)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        );
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(config.debug))
        .try_init();

    install_panic_hook();

    tracing::debug!(handler = ?config.handler, log_dir = ?config.log_dir, "Tracing initialized");
    Ok(())
}

fn env_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn,mongodb=warn", level)))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_file(config.enable_caller)
        .with_line_number(config.enable_caller);

    match config.handler {
        LogHandler::Console => layer.with_ansi(true).boxed(),
        LogHandler::Text => layer.with_ansi(false).compact().boxed(),
        LogHandler::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

fn install_panic_hook() {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("PANIC: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("PANIC: {}", s)
        } else {
            "PANIC: unknown cause".to_string()
        };

        tracing::error!(target: "panic", location = %location, message = %msg, "Application panicked");

        previous_hook(panic_info);
    }));
}

/// Removes rolled log files older than `retention_days`.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if matches!(age, Some(age) if age > retention) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}
