use crate::domain::Event;
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;

// Rough per-event size used to presize buffers
const ESTIMATED_EVENT_SIZE: usize = 256;
// Cap on the presized buffer, not on the payload
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Batch is empty")]
    EmptyBatch,
}

/// Request body ready to hand to the HTTP client.
#[derive(Debug, Clone)]
pub struct Payload {
    pub body: Bytes,
    pub compressed: bool,
    pub uncompressed_len: usize,
}

/// One event per line, newline-terminated.
pub fn to_ndjson(events: &[Arc<Event>]) -> Result<Vec<u8>, SerializationError> {
    if events.is_empty() {
        return Err(SerializationError::EmptyBatch);
    }

    let capacity = events
        .len()
        .saturating_mul(ESTIMATED_EVENT_SIZE)
        .min(MAX_PREALLOCATION);
    let mut buffer = Vec::with_capacity(capacity);

    for event in events {
        serde_json::to_writer(&mut buffer, event.as_ref())?;
        buffer.write_all(b"\n")?;
    }

    Ok(buffer)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// NDJSON body, gzip-compressed once the batch has more than
/// `compress_above` events.
pub fn batch_payload(
    events: &[Arc<Event>],
    compress_above: Option<usize>,
) -> Result<Payload, SerializationError> {
    let ndjson = to_ndjson(events)?;
    let uncompressed_len = ndjson.len();

    match compress_above {
        Some(threshold) if events.len() > threshold => Ok(Payload {
            body: Bytes::from(gzip(&ndjson)?),
            compressed: true,
            uncompressed_len,
        }),
        _ => Ok(Payload {
            body: Bytes::from(ndjson),
            compressed: false,
            uncompressed_len,
        }),
    }
}
