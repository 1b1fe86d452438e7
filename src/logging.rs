//! Process-wide `tracing` subscriber setup.

use std::str::FromStr;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of log lines.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(LoggerError::InvalidFormat(value.to_owned())),
        }
    }
}

/// Subscriber settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggingConfig {
    /// Line format.
    pub format: LogFormat,
    /// `EnvFilter` directives, for example `info` or `nodewright=debug`.
    pub level: String,
    /// Whether to print event targets.
    pub with_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: String::from("info"),
            with_targets: false,
        }
    }
}

/// Failures raised while installing the subscriber.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LoggerError {
    /// The format name is not `text` or `json`.
    #[error("invalid log format: {0} (expected text or json)")]
    InvalidFormat(String),
    /// The filter directives did not parse.
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    /// A global subscriber was already installed.
    #[error("logger has already been initialised")]
    AlreadyInitialized,
    /// Any other installation failure.
    #[error("failed to initialise logger: {0}")]
    InitializationFailed(String),
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for command output.
///
/// # Errors
///
/// Returns [`LoggerError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<(), LoggerError> {
    let filter = filter(&config.level)?;
    match config.format {
        LogFormat::Text => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(config.with_targets);
            install(tracing_subscriber::registry().with(filter).with(layer))
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_target(config.with_targets);
            install(tracing_subscriber::registry().with(filter).with(layer))
        }
    }
}

fn filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_owned()))
}

fn install<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|err| {
        let message = err.to_string();
        if message.contains("SetGlobalDefaultError") || message.contains("already been set") {
            LoggerError::AlreadyInitialized
        } else {
            LoggerError::InitializationFailed(message)
        }
    })
}
