use serde::{Deserialize, Serialize};

/// Coarse fill level of a bounded queue, reported through health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    None,
    Low,
    Medium,
    High,
}

impl BackpressureLevel {
    pub fn from_fill_ratio(ratio: f64) -> Self {
        if ratio < 0.5 {
            BackpressureLevel::None
        } else if ratio < 0.8 {
            BackpressureLevel::Low
        } else if ratio < 0.95 {
            BackpressureLevel::Medium
        } else {
            BackpressureLevel::High
        }
    }

    pub fn is_saturated(self) -> bool {
        matches!(self, BackpressureLevel::Medium | BackpressureLevel::High)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        assert_eq!(BackpressureLevel::from_fill_ratio(0.0), BackpressureLevel::None);
        assert_eq!(BackpressureLevel::from_fill_ratio(0.5), BackpressureLevel::Low);
        assert_eq!(BackpressureLevel::from_fill_ratio(0.8), BackpressureLevel::Medium);
        assert_eq!(BackpressureLevel::from_fill_ratio(1.0), BackpressureLevel::High);
        assert!(!BackpressureLevel::Low.is_saturated());
        assert!(BackpressureLevel::High.is_saturated());
    }
}
