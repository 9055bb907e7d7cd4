//! Tracing subscriber setup for programs embedding sutrun.

use crate::config::EnvParser;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid log file path: {}", .0.display())]
    InvalidPath(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Where and how log events are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Additional JSON log file.
    pub file: Option<PathBuf>,
    /// Console output goes to stderr instead of stdout.
    pub stderr: bool,
}

impl LogConfig {
    /// Read `SUTRUN_LOG_LEVEL`, `SUTRUN_LOG_FORMAT` and `SUTRUN_LOG_FILE`.
    /// Invalid values fall back to the defaults.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).value;
        let format = match parser.get_string("LOG_FORMAT", "pretty").value.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = parser.get_optional_string("LOG_FILE").value.map(PathBuf::from);

        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.level)?),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            stderr: false,
        }
    }
}

/// Keeps background log writers alive. Drop it last.
#[must_use]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = fmt::layer().with_target(true);
    let console = match (config.format, config.stderr) {
        (LogFormat::Json, true) => console.json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => console.json().with_writer(std::io::stdout).boxed(),
        (LogFormat::Pretty, true) => console.with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => console.with_writer(std::io::stdout).boxed(),
    };
    layers.push(console);

    let mut file_guard = None;
    if let Some(path) = &config.file {
        let (dir, name) = split_log_path(path)?;
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.filter()?)
        .try_init()?;

    Ok(LoggingGuards { _file: file_guard })
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError> {
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}
