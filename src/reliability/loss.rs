use crate::domain::Event;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Why an event left the normal delivery path.
///
/// The same reason is reported whether the event ended up in the spill file
/// or was dropped; `SpilloverFull`, `SpilloverWriteFailed` and
/// `SpilloverAbandoned` are only ever drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    QueueFull,
    ShutdownInProgress,
    CircuitOpen,
    RetriesExhausted,
    NonRetryable,
    RetryRejected,
    RetryCancelled,
    ShutdownDrain,
    SpilloverFull,
    SpilloverWriteFailed,
    SpilloverAbandoned,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::QueueFull => "queue_full",
            LossReason::ShutdownInProgress => "shutdown_in_progress",
            LossReason::CircuitOpen => "circuit_open",
            LossReason::RetriesExhausted => "retries_exhausted",
            LossReason::NonRetryable => "non_retryable",
            LossReason::RetryRejected => "retry_rejected",
            LossReason::RetryCancelled => "retry_cancelled",
            LossReason::ShutdownDrain => "shutdown_drain",
            LossReason::SpilloverFull => "spillover_full",
            LossReason::SpilloverWriteFailed => "spillover_write_failed",
            LossReason::SpilloverAbandoned => "spillover_abandoned",
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type LossCallback = Arc<dyn Fn(&Event, LossReason) + Send + Sync>;

/// Invokes the application's loss callback behind a panic boundary.
#[derive(Clone, Default)]
pub struct LossNotifier {
    callback: Option<LossCallback>,
    callback_panics: Arc<AtomicU64>,
}

impl LossNotifier {
    pub fn from_fn(callback: impl Fn(&Event, LossReason) + Send + Sync + 'static) -> Self {
        Self::new(Some(Arc::new(callback)))
    }

    pub fn new(callback: Option<LossCallback>) -> Self {
        Self {
            callback,
            callback_panics: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn notify(&self, event: &Event, reason: LossReason) {
        let Some(callback) = &self.callback else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| callback(event, reason))).is_err() {
            self.callback_panics.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.event_id,
                reason = %reason,
                "Loss callback panicked; ignoring"
            );
        }
    }

    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for LossNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossNotifier")
            .field("callback", &self.callback.is_some())
            .field("callback_panics", &self.callback_panics())
            .finish()
    }
}
