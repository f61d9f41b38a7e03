//! Circuit breaker shared by every sender worker.
//!
//! closed → open once `threshold` consecutive failures are recorded; open →
//! closed when a worker observes that `reset_window` has elapsed since the
//! circuit opened. There is no half-open trial state: the first item checked
//! after the window is simply attempted, and its outcome decides whether the
//! circuit opens again.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub open: bool,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: u32,
    reset_window: Duration,
    state: Mutex<CircuitState>,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_window,
            state: Mutex::new(CircuitState {
                open: false,
                consecutive_failures: 0,
                opened_at: None,
            }),
            times_opened: AtomicU64::new(0),
        }
    }

    /// Whether a send may be attempted now. Closes an open circuit whose
    /// reset window has elapsed.
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return true;
        }

        let elapsed = state
            .opened_at
            .map_or(Duration::MAX, |opened_at| now.saturating_duration_since(opened_at));
        if elapsed >= self.reset_window {
            state.open = false;
            state.consecutive_failures = 0;
            state.opened_at = None;
            info!("Circuit breaker reset window elapsed; closing circuit");
            true
        } else {
            false
        }
    }

    /// Resets the failure streak. An open circuit stays open until its reset
    /// window is observed to have elapsed.
    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if !state.open && state.consecutive_failures >= self.threshold {
            state.open = true;
            state.opened_at = Some(now);
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("threshold", &self.threshold)
            .field("reset_window", &self.reset_window)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(breaker.allow_request());
        assert!(!breaker.is_open());
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());

        assert!(breaker.is_open());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.times_opened(), 1);
    }

    #[test]
    fn success_resets_streak_but_not_open_flag() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());

        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(breaker.is_open());
        assert_eq!(breaker.state().consecutive_failures, 0);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn closes_once_reset_window_is_observed() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(500));
        let opened_at = Instant::now();
        assert!(breaker.record_failure_at(opened_at));

        assert!(!breaker.allow_request_at(opened_at + Duration::from_millis(499)));
        assert!(breaker.allow_request_at(opened_at + Duration::from_millis(500)));

        let state = breaker.state();
        assert!(!state.open);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.opened_at, None);
    }

    #[test]
    fn failure_after_reset_reopens_with_threshold_one() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let t0 = Instant::now();
        breaker.record_failure_at(t0);
        assert!(breaker.allow_request_at(t0 + Duration::from_millis(10)));

        assert!(breaker.record_failure_at(t0 + Duration::from_millis(11)));
        assert!(!breaker.allow_request_at(t0 + Duration::from_millis(12)));
        assert_eq!(breaker.times_opened(), 2);
    }
}
