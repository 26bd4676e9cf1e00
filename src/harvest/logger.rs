//! Structured logging for the story harvester
//!
//! Console output plus an optional daily-rolling log file, both filtered by
//! `RUST_LOG` when set and by `logging.log_level` otherwise.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoUtc},
    prelude::*,
    EnvFilter, Layer,
};

use crate::harvest::config_loader::AppConfig;

const LOG_FILE_PREFIX: &str = "story_harvester.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the non-blocking file writer alive; drop it last to flush.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build the env filter, preferring `RUST_LOG` over the configured level
pub fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggerError::Logging(e.to_string()))
}

/// Initialize the global tracing subscriber from the app config
pub fn init_logger(app_config: &AppConfig) -> LoggerResult<LoggerGuard> {
    let logging = &app_config.logging;
    let json = logging.log_format.eq_ignore_ascii_case("json");

    let console_layer = if json {
        fmt::layer()
            .json()
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    };

    let (file_layer, file_guard) = if logging.log_to_file {
        let log_dir = Path::new(&app_config.paths.log_directory);
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = if json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(build_filter(&logging.log_level)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %logging.log_format,
        log_level = %logging.log_level,
        log_to_file = logging.log_to_file,
        "Logger initialized"
    );

    Ok(LoggerGuard {
        _file_guard: file_guard,
    })
}
