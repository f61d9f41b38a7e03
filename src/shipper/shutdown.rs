//! Ordered, time-bounded shutdown.
//!
//! 1. Stop accepting events and wait out `log()` calls already past the gate.
//! 2. Let the senders drain the queue, up to `drain_timeout`.
//! 3. Stop the senders, waiting up to `sender_stop_timeout` for in-flight sends.
//!    Items of aborted sends are spilled or failed.
//! 4. Cancel pending retries; each cancelled item is spilled or failed.
//! 5. Divert whatever is still queued the same way.
//! 6. Stop the spill writer after `spill_flush_timeout`.
//!
//! Every wait is bounded, so shutdown always finishes, and every item still
//! owned by the shipper ends up counted.

use super::{Lifecycle, ShipperInner};
use crate::reliability::LossReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Final accounting returned by `shutdown()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSummary {
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
    pub spilled: u64,
    pub rejected: u64,
    /// Whether the queue emptied through normal delivery before the drain
    /// timeout.
    pub drained_cleanly: bool,
    pub elapsed_ms: u64,
}

impl ShutdownSummary {
    /// `sent + failed + spilled == queued`.
    pub fn is_balanced(&self) -> bool {
        self.sent + self.failed + self.spilled == self.queued
    }
}

pub(crate) async fn shutdown(inner: &ShipperInner) -> ShutdownSummary {
    inner
        .summary
        .get_or_init(|| run(inner))
        .await
        .clone()
}

async fn run(inner: &ShipperInner) -> ShutdownSummary {
    let started = Instant::now();
    let config = &inner.config;
    info!("Shutting down event shipper");

    inner.set_lifecycle(Lifecycle::ShuttingDown);
    while inner.producers.load(Ordering::SeqCst) > 0 {
        tokio::task::yield_now().await;
    }

    let drained_cleanly = wait_for_drain(inner, config.drain_timeout()).await;
    if !drained_cleanly {
        warn!(
            remaining = inner.queue.depth(),
            "Queue did not drain within {:?}",
            config.drain_timeout()
        );
    }

    let abandoned = inner
        .senders
        .lock()
        .await
        .stop(config.sender_stop_timeout())
        .await;
    if !abandoned.is_empty() {
        error!(
            abandoned = abandoned.len(),
            "In-flight sends abandoned at shutdown"
        );
    }
    for item in abandoned {
        inner.ledger.divert(item, LossReason::ShutdownDrain);
    }

    let cancelled = inner.scheduler.shutdown().await;
    for item in cancelled {
        inner.ledger.divert(item, LossReason::RetryCancelled);
    }

    let remaining = inner.queue.drain().await;
    if !remaining.is_empty() {
        warn!("Diverting {} undelivered events", remaining.len());
    }
    for item in remaining {
        inner.ledger.divert(item, LossReason::ShutdownDrain);
    }

    if let Some(spillover) = &inner.spillover {
        spillover.stop(config.spill_flush_timeout()).await;
    }

    inner.set_lifecycle(Lifecycle::Stopped);

    let snapshot = inner.metrics.snapshot(inner.gauges());
    let summary = ShutdownSummary {
        queued: snapshot.queued,
        sent: snapshot.sent,
        failed: snapshot.failed,
        spilled: snapshot.spilled,
        rejected: snapshot.rejected,
        drained_cleanly,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    if summary.is_balanced() {
        info!(
            sent = summary.sent,
            failed = summary.failed,
            spilled = summary.spilled,
            rejected = summary.rejected,
            elapsed_ms = summary.elapsed_ms,
            "Event shipper stopped"
        );
    } else {
        error!(
            queued = summary.queued,
            sent = summary.sent,
            failed = summary.failed,
            spilled = summary.spilled,
            "Event shipper stopped with unbalanced accounting"
        );
    }

    summary
}

/// Waits until nothing is queued or in flight. Returns `false` on timeout.
async fn wait_for_drain(inner: &ShipperInner, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if inner.queue.is_empty() && inner.in_flight.is_empty() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
