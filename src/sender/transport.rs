use crate::domain::Event;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Why a delivery attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Server error: HTTP {status}{}", describe(.code, .message))]
    Server {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    #[error("Rate limited{}", describe(.code, .message))]
    RateLimited {
        code: Option<String>,
        message: Option<String>,
    },
    #[error("Client error: HTTP {status}{}", describe(.code, .message))]
    Client {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
}

fn describe(code: &Option<String>, message: &Option<String>) -> String {
    match (code, message) {
        (Some(code), Some(message)) => format!(" [{code}] {message}"),
        (Some(code), None) => format!(" [{code}]"),
        (None, Some(message)) => format!(" {message}"),
        (None, None) => String::new(),
    }
}

impl DeliveryError {
    /// Maps a non-2xx HTTP status to its error class.
    pub fn from_status(status: u16, code: Option<String>, message: Option<String>) -> Self {
        match status {
            429 => DeliveryError::RateLimited { code, message },
            500..=599 => DeliveryError::Server {
                status,
                code,
                message,
            },
            _ => DeliveryError::Client {
                status,
                code,
                message,
            },
        }
    }

    /// 5xx, 429 and transport failures are worth another attempt; other 4xx
    /// responses are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Client { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Server { status, .. } | DeliveryError::Client { status, .. } => {
                Some(*status)
            }
            DeliveryError::RateLimited { .. } => Some(429),
            DeliveryError::Transport(_) => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            DeliveryError::Server { code, .. }
            | DeliveryError::RateLimited { code, .. }
            | DeliveryError::Client { code, .. } => code.as_deref(),
            DeliveryError::Transport(_) => None,
        }
    }
}

/// Result of a batch call that reached the endpoint.
///
/// `rejected` lists the indices (into the submitted slice) the endpoint
/// refused while accepting the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub rejected: Vec<(usize, DeliveryError)>,
}

impl BatchReport {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub type Outcome = Result<(), DeliveryError>;
pub type BatchOutcome = Result<BatchReport, DeliveryError>;

/// One network call against the ingestion endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_one(&self, event: &Event) -> Outcome;

    /// An `Err` means the batch as a whole failed; the caller falls back to
    /// individual sends.
    async fn send_batch(&self, events: &[Arc<Event>]) -> BatchOutcome;
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the bearer token attached to every request.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TokenError>;
}

/// A token fixed at startup.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, TokenError> {
        if self.token.is_empty() {
            return Err(TokenError::Unavailable("empty token".to_string()));
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(matches!(
            DeliveryError::from_status(503, None, None),
            DeliveryError::Server { status: 503, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(429, None, None),
            DeliveryError::RateLimited { .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(400, None, None),
            DeliveryError::Client { status: 400, .. }
        ));
    }

    #[test]
    fn only_client_errors_are_final() {
        assert!(DeliveryError::from_status(500, None, None).is_retryable());
        assert!(DeliveryError::from_status(429, None, None).is_retryable());
        assert!(DeliveryError::Transport("reset".into()).is_retryable());
        assert!(!DeliveryError::from_status(422, None, None).is_retryable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let error = DeliveryError::from_status(
            400,
            Some("INVALID_EVENT".to_string()),
            Some("name missing".to_string()),
        );
        assert_eq!(
            error.to_string(),
            "Client error: HTTP 400 [INVALID_EVENT] name missing"
        );
        assert_eq!(error.code(), Some("INVALID_EVENT"));
    }

    #[tokio::test]
    async fn static_token_provider_rejects_empty_token() {
        assert_eq!(StaticTokenProvider::new("t0k").token().await.unwrap(), "t0k");
        assert!(StaticTokenProvider::new("").token().await.is_err());
    }
}
