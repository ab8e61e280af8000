//! Structured logging for the Pexels downloader
//!
//! Console output plus an optional daily-rotated log file, in line or JSON format.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::filter_fn,
    fmt,
    prelude::*,
    EnvFilter,
};

use crate::pexels::AppConfig;
use crate::pexels::events::SESSION_TARGET;

const LOG_FILE_NAME: &str = "pexels_downloader.log";

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

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct Logger {
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Installs the global subscriber described by the logging section of `config`.
    pub fn init(config: &AppConfig) -> LoggerResult<Self> {
        let filter = build_filter(&config.logging.log_level)?;

        // Session status lines are rendered by the shell, so the console skips them.
        let console_layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter_fn(|metadata| metadata.target() != SESSION_TARGET));

        if !config.logging.log_to_file {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init()
                .map_err(|e| LoggerError::Logging(e.to_string()))?;

            return Ok(Self { log_dir: None, _guard: None });
        }

        let log_dir = PathBuf::from(&config.paths.log_directory);
        if !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = match config.logging.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = %config.logging.log_format,
            log_level = %config.logging.log_level,
            log_dir = %log_dir.display(),
            "Logger initialized"
        );

        Ok(Self { log_dir: Some(log_dir), _guard: Some(guard) })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggerError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_level() {
        assert!(build_filter("debug").is_ok());
    }
}
