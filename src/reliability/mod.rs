pub mod circuit;
pub mod health;
pub mod ledger;
pub mod loss;
pub mod metrics;
pub mod retry;
pub mod spillover;

pub use circuit::{CircuitBreaker, CircuitState};
pub use health::{HealthReport, HealthStatus};
pub use ledger::{Disposition, Ledger};
pub use loss::{LossCallback, LossNotifier, LossReason};
#[cfg(feature = "metrics")]
pub use metrics::PrometheusExporter;
pub use metrics::{GaugeReadings, MetricsError, MetricsSnapshot, ShipperMetrics};
pub use retry::{Backoff, RetryScheduler};
pub use spillover::{SpillReader, SpillRecord, SpilloverControl, SpilloverError, SpilloverQueue};
