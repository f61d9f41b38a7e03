use super::config::{ConfigError, LogFormat, LogLevel, ShipperConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Ships NDJSON events to a rask ingestion endpoint", long_about = None)]
pub struct Cli {
    /// Ingestion endpoint base URL
    #[arg(long, env = "RASK_SHIPPER_ENDPOINT", default_value = "http://localhost:9600")]
    pub endpoint: String,

    /// Bearer token sent with every request
    #[arg(long, env = "RASK_SHIPPER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Read events from this file instead of stdin
    #[arg(long, env = "RASK_SHIPPER_INPUT")]
    pub input: Option<PathBuf>,

    /// Load shipper settings from a TOML file (replaces the flag values)
    #[arg(long, env = "RASK_SHIPPER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "RASK_SHIPPER_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "RASK_SHIPPER_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Serve /metrics and /health on this port
    #[arg(long, env = "RASK_SHIPPER_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Gzip batches with more events than this
    #[arg(long, env = "RASK_SHIPPER_COMPRESS_ABOVE", default_value = "100")]
    pub compress_above: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "RASK_SHIPPER_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Replay spill files left by earlier runs before reading input
    #[arg(long, env = "RASK_SHIPPER_REPLAY_SPILL")]
    pub replay_spill: bool,

    #[command(flatten)]
    pub shipper: ShipperConfig,
}

impl Cli {
    /// The effective shipper settings: the config file when one is given,
    /// otherwise the flags.
    pub fn shipper_config(&self) -> Result<ShipperConfig, ConfigError> {
        let config = match &self.config_file {
            Some(path) => ShipperConfig::from_file(path)?,
            None => self.shipper.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
