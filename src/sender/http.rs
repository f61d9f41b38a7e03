use super::serialization::{SerializationError, batch_payload};
use super::transport::{
    BatchOutcome, BatchReport, DeliveryError, Outcome, TokenProvider, Transport,
};
use crate::domain::Event;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const EVENTS_PATH: &str = "v1/events";
const BATCH_PATH: &str = "v1/events/batch";

#[derive(Error, Debug)]
pub enum HttpTransportError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
    /// Gzip batch bodies holding more than this many events.
    pub compress_above: Option<usize>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9600".to_string(),
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_connections: 20,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: format!("rask-event-shipper/{}", env!("CARGO_PKG_VERSION")),
            compress_above: Some(100),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponseBody {
    #[serde(default)]
    errors: Vec<RejectedEntry>,
}

#[derive(Debug, Deserialize)]
struct RejectedEntry {
    index: usize,
    status: u16,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Reference [`Transport`] posting JSON to the ingestion endpoint.
///
/// Single events go to `{endpoint}/v1/events` as one JSON object; batches go
/// to `{endpoint}/v1/events/batch` as NDJSON.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
    events_url: Url,
    batch_url: Url,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl HttpTransport {
    pub fn new(
        config: HttpTransportConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self, HttpTransportError> {
        let mut base: Url = config.endpoint.parse().map_err(|e| {
            HttpTransportError::InvalidConfiguration(format!("Invalid endpoint URL: {}", e))
        })?;
        if base.cannot_be_a_base() {
            return Err(HttpTransportError::InvalidConfiguration(format!(
                "Endpoint cannot be a base URL: {}",
                config.endpoint
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let events_url = base.join(EVENTS_PATH).map_err(|e| {
            HttpTransportError::InvalidConfiguration(format!("Invalid events URL: {}", e))
        })?;
        let batch_url = base.join(BATCH_PATH).map_err(|e| {
            HttpTransportError::InvalidConfiguration(format!("Invalid batch URL: {}", e))
        })?;

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                HttpTransportError::InvalidConfiguration(format!(
                    "Failed to build HTTP client: {}",
                    e
                ))
            })?;

        Ok(Self {
            client,
            config,
            events_url,
            batch_url,
            token_provider,
        })
    }

    pub fn events_url(&self) -> &Url {
        &self.events_url
    }

    pub fn batch_url(&self) -> &Url {
        &self.batch_url
    }

    async fn auth_headers(&self) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        if let Some(provider) = &self.token_provider {
            let token = provider
                .token()
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| DeliveryError::Transport(format!("Invalid token header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn error_from_response(response: Response) -> DeliveryError {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        let ErrorBody { code, message } = serde_json::from_slice(&body).unwrap_or_default();
        DeliveryError::from_status(status, code, message)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("events_url", &self.events_url.as_str())
            .field("batch_url", &self.batch_url.as_str())
            .field("authenticated", &self.token_provider.is_some())
            .finish()
    }
}

fn transport_error(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::Transport(format!("Request timeout: {error}"))
    } else if error.is_connect() {
        DeliveryError::Transport(format!("Connection failed: {error}"))
    } else {
        DeliveryError::Transport(error.to_string())
    }
}

fn serialization_error(error: SerializationError) -> DeliveryError {
    // Retrying cannot fix an event that does not serialize.
    DeliveryError::Client {
        status: 0,
        code: Some("SERIALIZATION".to_string()),
        message: Some(error.to_string()),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_one(&self, event: &Event) -> Outcome {
        let start = Instant::now();
        let headers = self.auth_headers().await?;

        let response = self
            .client
            .post(self.events_url.clone())
            .headers(headers)
            .json(event)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            debug!(event_id = %event.event_id, "Sent event in {:?}", start.elapsed());
            Ok(())
        } else {
            let error = Self::error_from_response(response).await;
            warn!(event_id = %event.event_id, "Event rejected: {}", error);
            Err(error)
        }
    }

    async fn send_batch(&self, events: &[Arc<Event>]) -> BatchOutcome {
        let start = Instant::now();
        let payload = batch_payload(events, self.config.compress_above).map_err(serialization_error)?;
        let bytes_sent = payload.body.len();
        let uncompressed_len = payload.uncompressed_len;

        let mut headers = self.auth_headers().await?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
        if payload.compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let response = self
            .client
            .post(self.batch_url.clone())
            .headers(headers)
            .body(payload.body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let error = Self::error_from_response(response).await;
            warn!("Batch of {} events failed: {}", events.len(), error);
            return Err(error);
        }

        let body = response.bytes().await.unwrap_or_default();
        let parsed: BatchResponseBody = serde_json::from_slice(&body).unwrap_or_default();
        let rejected = parsed
            .errors
            .into_iter()
            .filter(|entry| entry.index < events.len())
            .map(|entry| {
                (
                    entry.index,
                    DeliveryError::from_status(entry.status, entry.code, entry.message),
                )
            })
            .collect();

        debug!(
            "Sent batch of {} events ({} bytes, {} before compression, compressed: {}) in {:?}",
            events.len(),
            bytes_sent,
            uncompressed_len,
            payload.compressed,
            start.elapsed()
        );

        Ok(BatchReport { rejected })
    }
}
