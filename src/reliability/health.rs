use crate::buffer::BackpressureLevel;
use crate::shipper::Lifecycle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub lifecycle: Lifecycle,
    pub circuit_open: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressureLevel,
    pub pending_retries: usize,
}

impl HealthReport {
    pub fn evaluate(
        lifecycle: Lifecycle,
        circuit_open: bool,
        queue_depth: usize,
        queue_capacity: usize,
        backpressure: BackpressureLevel,
        pending_retries: usize,
    ) -> Self {
        let status = if lifecycle != Lifecycle::Running {
            HealthStatus::Unhealthy
        } else if circuit_open || backpressure == BackpressureLevel::High {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            lifecycle,
            circuit_open,
            queue_depth,
            queue_capacity,
            backpressure,
            pending_retries,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
