use super::config::{LogFormat, LogLevel};
use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug, Clone)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {details}")]
    InvalidFilter { filter: String, details: String },
    #[error("Failed to install global tracing subscriber: {0}")]
    InstallFailed(String),
}

// Chatty dependencies held at warn unless RUST_LOG says otherwise
const DEFAULT_DIRECTIVES: &[&str] = &["hyper=warn", "reqwest=warn", "h2=warn", "warp=warn"];

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// `RUST_LOG` when set, otherwise `level` plus the dependency directives.
pub fn build_filter_string(level: LogLevel) -> String {
    if let Ok(filter) = std::env::var("RUST_LOG")
        && !filter.trim().is_empty()
    {
        return filter;
    }

    let mut parts = Vec::with_capacity(DEFAULT_DIRECTIVES.len() + 1);
    parts.push(level_str(level));
    parts.extend_from_slice(DEFAULT_DIRECTIVES);
    parts.join(",")
}

/// Installs the global subscriber. Later calls return the first call's
/// result without touching the subscriber.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    static INIT: OnceLock<Result<(), LoggingError>> = OnceLock::new();

    INIT.get_or_init(|| install(level, format)).clone()
}

fn install(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter_string(level);
    let env_filter = EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter: filter.clone(),
        details: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| LoggingError::InstallFailed(e.to_string()))
}
