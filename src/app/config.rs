use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// Keep in line with the queue's own allocation guard
const MAX_QUEUE_CAPACITY: usize = 100_000_000;
const MAX_SPILLOVER_CAPACITY: usize = 100_000_000;
const MAX_SENDER_THREADS: usize = 256;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Environment error: {0}")]
    EnvError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Tuning knobs for one shipper instance.
///
/// Durations are carried as milliseconds so the same struct reads from TOML,
/// environment variables and command-line flags; use the accessor methods
/// for `Duration` values.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    /// Maximum number of events waiting for a sender
    #[arg(long, env = "RASK_SHIPPER_QUEUE_CAPACITY", default_value = "10000")]
    pub queue_capacity: usize,

    /// Number of concurrent sender workers
    #[arg(long, env = "RASK_SHIPPER_SENDER_THREADS", default_value = "2")]
    pub sender_threads: usize,

    /// Maximum events per batch request
    #[arg(long, env = "RASK_SHIPPER_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// How long a worker waits to fill a batch, in milliseconds
    #[arg(long, env = "RASK_SHIPPER_MAX_BATCH_WAIT_MS", default_value = "50")]
    pub max_batch_wait_ms: u64,

    /// Failed attempts allowed before an event is given up on
    #[arg(long, env = "RASK_SHIPPER_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    #[arg(long, env = "RASK_SHIPPER_BASE_RETRY_DELAY_MS", default_value = "1000")]
    pub base_retry_delay_ms: u64,

    #[arg(long, env = "RASK_SHIPPER_MAX_RETRY_DELAY_MS", default_value = "30000")]
    pub max_retry_delay_ms: u64,

    /// Consecutive failures before the circuit opens
    #[arg(long, env = "RASK_SHIPPER_CIRCUIT_BREAKER_THRESHOLD", default_value = "5")]
    pub circuit_breaker_threshold: u32,

    /// Cooldown before sends are attempted again, in milliseconds
    #[arg(long, env = "RASK_SHIPPER_CIRCUIT_BREAKER_RESET_MS", default_value = "30000")]
    pub circuit_breaker_reset_ms: u64,

    /// Directory for spill files; spillover is disabled when unset
    #[arg(long, env = "RASK_SHIPPER_SPILLOVER_PATH")]
    pub spillover_path: Option<PathBuf>,

    /// Maximum events waiting for the spill writer
    #[arg(long, env = "RASK_SHIPPER_SPILLOVER_CAPACITY", default_value = "10000")]
    pub spillover_capacity: usize,

    /// Install a SIGINT/SIGTERM listener that shuts the shipper down
    #[arg(long, env = "RASK_SHIPPER_REGISTER_SHUTDOWN_HOOK")]
    pub register_shutdown_hook: bool,

    /// Worker queue poll timeout, in milliseconds
    #[arg(long, env = "RASK_SHIPPER_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,

    /// Re-queue delay while the circuit is open and spillover is disabled
    #[arg(long, env = "RASK_SHIPPER_CIRCUIT_OPEN_REQUEUE_MS", default_value = "1000")]
    pub circuit_open_requeue_ms: u64,

    /// How long shutdown waits for the queue to drain normally
    #[arg(long, env = "RASK_SHIPPER_DRAIN_TIMEOUT_MS", default_value = "5000")]
    pub drain_timeout_ms: u64,

    /// How long shutdown waits for in-flight sends
    #[arg(long, env = "RASK_SHIPPER_SENDER_STOP_TIMEOUT_MS", default_value = "5000")]
    pub sender_stop_timeout_ms: u64,

    /// How long shutdown waits for the spill writer to flush
    #[arg(long, env = "RASK_SHIPPER_SPILL_FLUSH_TIMEOUT_MS", default_value = "5000")]
    pub spill_flush_timeout_ms: u64,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            sender_threads: 2,
            batch_size: 100,
            max_batch_wait_ms: 50,
            max_retries: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_ms: 30_000,
            spillover_path: None,
            spillover_capacity: 10_000,
            register_shutdown_hook: false,
            poll_interval_ms: 100,
            circuit_open_requeue_ms: 1000,
            drain_timeout_ms: 5000,
            sender_stop_timeout_ms: 5000,
            spill_flush_timeout_ms: 5000,
        }
    }
}

impl ShipperConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ShipperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `RASK_SHIPPER_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ShipperConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        load_env_var("RASK_SHIPPER_QUEUE_CAPACITY", &mut self.queue_capacity)?;
        load_env_var("RASK_SHIPPER_SENDER_THREADS", &mut self.sender_threads)?;
        load_env_var("RASK_SHIPPER_BATCH_SIZE", &mut self.batch_size)?;
        load_env_var("RASK_SHIPPER_MAX_BATCH_WAIT_MS", &mut self.max_batch_wait_ms)?;
        load_env_var("RASK_SHIPPER_MAX_RETRIES", &mut self.max_retries)?;
        load_env_var("RASK_SHIPPER_BASE_RETRY_DELAY_MS", &mut self.base_retry_delay_ms)?;
        load_env_var("RASK_SHIPPER_MAX_RETRY_DELAY_MS", &mut self.max_retry_delay_ms)?;
        load_env_var(
            "RASK_SHIPPER_CIRCUIT_BREAKER_THRESHOLD",
            &mut self.circuit_breaker_threshold,
        )?;
        load_env_var(
            "RASK_SHIPPER_CIRCUIT_BREAKER_RESET_MS",
            &mut self.circuit_breaker_reset_ms,
        )?;
        load_env_path_opt("RASK_SHIPPER_SPILLOVER_PATH", &mut self.spillover_path);
        load_env_var("RASK_SHIPPER_SPILLOVER_CAPACITY", &mut self.spillover_capacity)?;
        load_env_var(
            "RASK_SHIPPER_REGISTER_SHUTDOWN_HOOK",
            &mut self.register_shutdown_hook,
        )?;
        load_env_var("RASK_SHIPPER_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        load_env_var(
            "RASK_SHIPPER_CIRCUIT_OPEN_REQUEUE_MS",
            &mut self.circuit_open_requeue_ms,
        )?;
        load_env_var("RASK_SHIPPER_DRAIN_TIMEOUT_MS", &mut self.drain_timeout_ms)?;
        load_env_var(
            "RASK_SHIPPER_SENDER_STOP_TIMEOUT_MS",
            &mut self.sender_stop_timeout_ms,
        )?;
        load_env_var(
            "RASK_SHIPPER_SPILL_FLUSH_TIMEOUT_MS",
            &mut self.spill_flush_timeout_ms,
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidConfig(format!(
                "Queue capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            )));
        }

        if self.sender_threads == 0 || self.sender_threads > MAX_SENDER_THREADS {
            return Err(ConfigError::InvalidConfig(format!(
                "Sender threads must be between 1 and {MAX_SENDER_THREADS}, got {}",
                self.sender_threads
            )));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.base_retry_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Base retry delay must be greater than 0".to_string(),
            ));
        }

        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "Max retry delay ({}ms) must be at least the base retry delay ({}ms)",
                self.max_retry_delay_ms, self.base_retry_delay_ms
            )));
        }

        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "Circuit breaker threshold must be greater than 0".to_string(),
            ));
        }

        if self.spillover_capacity == 0 || self.spillover_capacity > MAX_SPILLOVER_CAPACITY {
            return Err(ConfigError::InvalidConfig(format!(
                "Spillover capacity must be between 1 and {MAX_SPILLOVER_CAPACITY}, got {}",
                self.spillover_capacity
            )));
        }

        if let Some(path) = &self.spillover_path
            && path.as_os_str().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "Spillover path must not be empty".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn circuit_breaker_reset(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn circuit_open_requeue(&self) -> Duration {
        Duration::from_millis(self.circuit_open_requeue_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn sender_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_stop_timeout_ms)
    }

    pub fn spill_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.spill_flush_timeout_ms)
    }
}

/// Loads and parses an environment variable, keeping the current value when
/// the variable is not set.
fn load_env_var<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {name}: {e}")))?;
    }
    Ok(())
}

fn load_env_path_opt(name: &str, target: &mut Option<PathBuf>) {
    if let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        *target = Some(PathBuf::from(value));
    }
}
