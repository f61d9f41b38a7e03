use thiserror::Error;

/// Top-level error type for building and running the shipper.
///
/// Only construction can fail; once running, outcomes surface through
/// metrics and the loss callback instead.
#[derive(Error, Debug)]
pub enum ShipperError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::app::ConfigError),

    #[error("No transport supplied")]
    MissingTransport,

    #[error("Spillover error: {0}")]
    Spillover(#[from] crate::reliability::SpilloverError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::buffer::BufferError),

    #[error("No tokio runtime available to spawn shipper tasks")]
    NoRuntime,
}
