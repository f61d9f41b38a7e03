use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifiers carried alongside an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl Correlation {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none() && self.trace_id.is_none() && self.span_id.is_none()
    }
}

/// A structured process event recorded by application code.
///
/// The shipper treats events as opaque: it never reads or rewrites the
/// business fields, it only wraps them for bookkeeping and hands them to the
/// transport or the spill file as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Correlation::is_empty")]
    pub correlation: Correlation,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            name: name.into(),
            correlation: Correlation::default(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }
}

/// Request-scoped correlation context.
///
/// Callers thread this value through their own call chain and use it to
/// stamp events; the shipper never reads ambient thread-local state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    correlation: Correlation,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation.correlation_id = Some(id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.correlation.trace_id = Some(trace_id.into());
        self.correlation.span_id = Some(span_id.into());
        self
    }

    /// Derives a child context for a nested span, keeping the trace and
    /// correlation ids.
    pub fn child(&self, span_id: impl Into<String>) -> Self {
        let mut correlation = self.correlation.clone();
        correlation.span_id = Some(span_id.into());
        Self { correlation }
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    pub fn event(&self, name: impl Into<String>, payload: serde_json::Value) -> Event {
        Event::new(name, payload).with_correlation(self.correlation.clone())
    }
}
