use super::loss::{LossNotifier, LossReason};
use super::metrics::ShipperMetrics;
use super::spillover::SpilloverQueue;
use crate::domain::QueuedItem;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an item went after leaving the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the spillover writer; it will be counted once written.
    Spilled,
    /// Counted as failed.
    Dropped,
}

/// Single place where items reach a terminal outcome.
///
/// Every component that gives up on an item goes through here, so each
/// queued item bumps exactly one of `sent`, `failed` or `spilled`, and the
/// loss callback fires for every item that leaves the delivery path.
#[derive(Clone, Debug)]
pub struct Ledger {
    metrics: Arc<ShipperMetrics>,
    notifier: LossNotifier,
    spillover: Option<SpilloverQueue>,
}

impl Ledger {
    pub fn new(
        metrics: Arc<ShipperMetrics>,
        notifier: LossNotifier,
        spillover: Option<SpilloverQueue>,
    ) -> Self {
        Self {
            metrics,
            notifier,
            spillover,
        }
    }

    pub fn metrics(&self) -> &Arc<ShipperMetrics> {
        &self.metrics
    }

    pub fn notifier(&self) -> &LossNotifier {
        &self.notifier
    }

    pub fn has_spillover(&self) -> bool {
        self.spillover.is_some()
    }

    pub fn spill_queue_depth(&self) -> usize {
        self.spillover.as_ref().map_or(0, SpilloverQueue::depth)
    }

    pub fn delivered(&self, count: u64) {
        self.metrics.record_sent(count);
    }

    /// Sends the item to spillover when it is enabled, otherwise drops it.
    /// The loss callback sees `reason` either way; a full spillover queue
    /// turns the loss into a `SpilloverFull` drop.
    pub fn divert(&self, item: QueuedItem, reason: LossReason) -> Disposition {
        let Some(spillover) = &self.spillover else {
            self.drop_item(&item, reason);
            return Disposition::Dropped;
        };

        let event = Arc::clone(item.event());
        match spillover.try_offer(item, reason) {
            Ok(()) => {
                debug!(event_id = %event.event_id, reason = %reason, "Event diverted to spillover");
                self.notifier.notify(&event, reason);
                Disposition::Spilled
            }
            Err(item) => {
                self.drop_item(&item, LossReason::SpilloverFull);
                Disposition::Dropped
            }
        }
    }

    /// Counts the item as failed and reports it.
    pub fn drop_item(&self, item: &QueuedItem, reason: LossReason) {
        self.metrics.record_failed(1);
        warn!(
            event_id = %item.event().event_id,
            event_name = %item.event().name,
            attempts = item.attempts(),
            age_ms = item.age().as_millis() as u64,
            reason = %reason,
            "Dropping event"
        );
        self.notifier.notify(item.event(), reason);
    }
}
