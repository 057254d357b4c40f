//! Subscriber initialisation

use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use common::error::{Error, Result};
use config::ConfigManager;

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(Error::Config(format!("Unknown log format: {}", s))),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Directory for a daily-rolling log file; stderr when unset
    pub directory: Option<PathBuf>,
}

impl LogSettings {
    /// Reads `log_level`, `log_format` and `log_directory`
    pub fn from_config(config: &ConfigManager) -> Result<Self> {
        Ok(Self {
            level: config.get_string("log_level")?,
            format: config.get_string("log_format")?.parse()?,
            directory: config.get_optional_string("log_directory").map(PathBuf::from),
        })
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
        }
    }
}

/// Installs the global subscriber
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process. Installing twice is reported as an error.
pub fn init(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", settings.level, e)))?;

    let (writer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "model-hub.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer);

    let installed = match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}
