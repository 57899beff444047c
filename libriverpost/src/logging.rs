//! Centralized logging configuration for the riverpost services
//!
//! Provides consistent logging setup with support for:
//! - Text, JSON, and pretty-printed console output
//! - An optional daily-rolling log file per service instance
//! - Environment variable configuration
//!
//! # Examples
//!
//! ```no_run
//! use libriverpost::logging::{LoggingConfig, LogFormat};
//!
//! let config = LoggingConfig::new(LogFormat::Json, "info".to_string(), false)
//!     .with_file("/var/log/riverpost", "poller-1");
//! let _guard = config.init().expect("logging");
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text output (no colors, for piping)
    Text,
    /// Machine-parseable JSON (one JSON object per line)
    Json,
    /// Pretty-printed with colors (for development)
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Configuration for logging initialization
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
    /// Directory and file stem for the rolling log file
    pub file: Option<(PathBuf, String)>,
}

impl LoggingConfig {
    /// Create a new logging configuration
    ///
    /// # Arguments
    ///
    /// * `format` - Console output format (text, json, or pretty)
    /// * `level` - Minimum log level (error, warn, info, debug, trace)
    /// * `verbose` - If true, defaults to debug level
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
            file: None,
        }
    }

    /// Also write plain-text logs to `<dir>/<name>.log`, rotated daily
    pub fn with_file(mut self, dir: impl Into<PathBuf>, name: &str) -> Self {
        self.file = Some((dir.into(), name.to_string()));
        self
    }

    fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }

    /// Initialize logging with the configured settings
    ///
    /// This should be called once at the start of the process. The returned
    /// guard flushes the file writer on drop and must be held until exit.
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let console: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .boxed(),
            LogFormat::Text => fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .boxed(),
        };

        let (file_layer, guard) = match &self.file {
            Some((dir, name)) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ConfigError::Logging(format!("cannot create {}: {}", dir.display(), e))
                })?;
                let appender = tracing_appender::rolling::daily(dir, format!("{}.log", name));
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .with(self.filter())
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;

        Ok(guard)
    }
}

/// Initialize logging with default settings
///
/// Respects `RIVERPOST_LOG_FORMAT` and `RIVERPOST_LOG_LEVEL` environment variables.
/// Falls back to text format with info level if not set. Errors (typically a
/// subscriber that is already installed) are ignored.
pub fn init_default() {
    let format = std::env::var("RIVERPOST_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);

    let level = std::env::var("RIVERPOST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let _ = LoggingConfig::new(format, level, false).init();
}
