#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[cfg(feature = "metrics")]
use tracing::{info, warn};
#[cfg(feature = "metrics")]
use warp::{Filter, Reply};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[cfg(feature = "metrics")]
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
    #[error("Metrics export disabled")]
    Disabled,
}

/// Point-in-time view of the shipper's counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Items created by `log()` while the shipper was running.
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
    pub spilled: u64,
    /// Retry schedulings (one item may be retried several times).
    pub retried: u64,
    /// `log()` calls refused because shutdown had begun.
    pub rejected: u64,
    pub queue_depth: usize,
    pub spill_queue_depth: usize,
    pub pending_retries: usize,
    pub circuit_open: bool,
}

impl MetricsSnapshot {
    /// Items that reached a terminal state.
    pub fn resolved(&self) -> u64 {
        self.sent + self.failed + self.spilled
    }

    /// Items still owned by the shipper (queued, in flight, awaiting retry or
    /// awaiting their spill write).
    pub fn unresolved(&self) -> u64 {
        self.queued.saturating_sub(self.resolved())
    }
}

/// Live gauge readings supplied by the components that own them.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeReadings {
    pub queue_depth: usize,
    pub spill_queue_depth: usize,
    pub pending_retries: usize,
    pub circuit_open: bool,
}

/// Lock-free counters shared by every worker.
///
/// Each queued item increments exactly one of `sent`, `failed` or `spilled`
/// over its lifetime.
pub struct ShipperMetrics {
    queued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    spilled: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,

    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusMetrics>,
}

impl ShipperMetrics {
    pub fn new() -> Self {
        Self {
            queued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            rejected: AtomicU64::new(0),

            #[cfg(feature = "metrics")]
            prometheus: match PrometheusMetrics::new() {
                Ok(prometheus) => Some(prometheus),
                Err(e) => {
                    warn!("Prometheus metrics unavailable: {}", e);
                    None
                }
            },
        }
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.mirror("queued", 1);
    }

    pub fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
        self.mirror("sent", count);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
        self.mirror("failed", count);
    }

    pub fn record_spilled(&self, count: u64) {
        self.spilled.fetch_add(count, Ordering::Relaxed);
        self.mirror("spilled", count);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.mirror("retried", 1);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.mirror("rejected", 1);
    }

    pub fn snapshot(&self, gauges: GaugeReadings) -> MetricsSnapshot {
        MetricsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queue_depth: gauges.queue_depth,
            spill_queue_depth: gauges.spill_queue_depth,
            pending_retries: gauges.pending_retries,
            circuit_open: gauges.circuit_open,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn export_metrics(&self, gauges: GaugeReadings) -> Result<String, MetricsError> {
        let prometheus = self.prometheus.as_ref().ok_or(MetricsError::Disabled)?;
        prometheus.queue_depth.set(gauges.queue_depth as i64);
        prometheus.spill_queue_depth.set(gauges.spill_queue_depth as i64);
        prometheus.pending_retries.set(gauges.pending_retries as i64);
        prometheus.circuit_open.set(i64::from(gauges.circuit_open));

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    #[cfg(not(feature = "metrics"))]
    pub fn export_metrics(&self, _gauges: GaugeReadings) -> Result<String, MetricsError> {
        Err(MetricsError::Disabled)
    }

    #[cfg(feature = "metrics")]
    fn mirror(&self, outcome: &str, count: u64) {
        if let Some(prometheus) = &self.prometheus {
            prometheus
                .events_total
                .with_label_values(&[outcome])
                .inc_by(count);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn mirror(&self, _outcome: &str, _count: u64) {}
}

impl Default for ShipperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShipperMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShipperMetrics")
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("sent", &self.sent.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .field("spilled", &self.spilled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "metrics")]
struct PrometheusMetrics {
    registry: Registry,
    events_total: IntCounterVec,
    queue_depth: IntGauge,
    spill_queue_depth: IntGauge,
    pending_retries: IntGauge,
    circuit_open: IntGauge,
}

#[cfg(feature = "metrics")]
impl PrometheusMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("rask_shipper_events_total", "Events by lifecycle outcome"),
            &["outcome"], // queued, sent, failed, spilled, retried, rejected
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let queue_depth = IntGauge::new("rask_shipper_queue_depth", "Items in the event queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let spill_queue_depth = IntGauge::new(
            "rask_shipper_spill_queue_depth",
            "Items waiting for the spillover writer",
        )?;
        registry.register(Box::new(spill_queue_depth.clone()))?;

        let pending_retries =
            IntGauge::new("rask_shipper_pending_retries", "Retries waiting on their timer")?;
        registry.register(Box::new(pending_retries.clone()))?;

        let circuit_open =
            IntGauge::new("rask_shipper_circuit_open", "1 while the circuit breaker is open")?;
        registry.register(Box::new(circuit_open.clone()))?;

        Ok(Self {
            registry,
            events_total,
            queue_depth,
            spill_queue_depth,
            pending_retries,
            circuit_open,
        })
    }
}

/// Serves `/metrics` and `/health` for a running shipper.
#[cfg(feature = "metrics")]
pub struct PrometheusExporter {
    port: u16,
    shipper: crate::shipper::EventShipper,
}

#[cfg(feature = "metrics")]
impl PrometheusExporter {
    pub fn new(port: u16, shipper: crate::shipper::EventShipper) -> Self {
        Self { port, shipper }
    }

    pub async fn serve(self) {
        let metrics_shipper = self.shipper.clone();
        let metrics = warp::path!("metrics")
            .and(warp::get())
            .map(move || match metrics_shipper.export_metrics() {
                Ok(metrics_text) => warp::reply::with_header(
                    metrics_text,
                    "content-type",
                    "text/plain; version=0.0.4",
                )
                .into_response(),
                Err(_) => warp::reply::with_status(
                    "Internal Server Error",
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                )
                .into_response(),
            });

        let health_shipper = self.shipper.clone();
        let health = warp::path!("health")
            .and(warp::get())
            .map(move || warp::reply::json(&health_shipper.health()));

        info!("Starting Prometheus metrics server on port {}", self.port);

        warp::serve(metrics.or(health))
            .run(([0, 0, 0, 0], self.port))
            .await;
    }
}
