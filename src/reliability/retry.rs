use super::ledger::Ledger;
use super::loss::LossReason;
use crate::buffer::EventQueue;
use crate::domain::QueuedItem;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Relative jitter applied on either side of the computed delay.
pub const JITTER_RATIO: f64 = 0.25;

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// `min(base * 2^attempt, max)`, saturating at `max` on overflow.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Base delay for `attempt` with ±25% jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::rng().random();
        apply_jitter(self.base_delay(attempt), sample)
    }
}

/// `delay + delay * 0.25 * (sample - 0.5) * 2` for `sample` in `[0, 1)`.
pub fn apply_jitter(delay: Duration, sample: f64) -> Duration {
    let factor = 1.0 + JITTER_RATIO * (sample.clamp(0.0, 1.0) - 0.5) * 2.0;
    delay.mul_f64(factor)
}

struct PendingRetry {
    item: QueuedItem,
    handle: Option<AbortHandle>,
}

#[derive(Default)]
struct PendingRetries {
    closed: bool,
    entries: HashMap<u64, PendingRetry>,
}

struct SchedulerInner {
    backoff: Backoff,
    queue: Arc<EventQueue>,
    ledger: Ledger,
    pending: Mutex<PendingRetries>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

/// Re-inserts failed items into the Event Queue after a backoff delay.
///
/// Each retry is a timer task on the runtime. Pending items stay recorded
/// here until their timer fires, so shutdown can take them back instead of
/// losing them with the aborted task.
#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl RetryScheduler {
    pub fn new(backoff: Backoff, queue: Arc<EventQueue>, ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backoff,
                queue,
                ledger,
                pending: Mutex::new(PendingRetries::default()),
                tracker: TaskTracker::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules `item` (already carrying its incremented attempt count) with
    /// the backoff delay of the attempt that just failed.
    ///
    /// Returns the item when the scheduler no longer accepts work.
    pub fn schedule_retry(&self, item: QueuedItem) -> Result<Duration, QueuedItem> {
        let delay = self
            .inner
            .backoff
            .delay(item.attempts().saturating_sub(1));
        self.schedule_after(item, delay)?;
        self.inner.ledger.metrics().record_retry();
        Ok(delay)
    }

    /// Schedules re-insertion after a fixed delay.
    pub fn schedule_after(&self, item: QueuedItem, delay: Duration) -> Result<(), QueuedItem> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;

        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(item);
            }
            pending.entries.insert(
                id,
                PendingRetry {
                    item,
                    handle: None,
                },
            );
        }

        let scheduler = self.clone();
        let handle = self.inner.tracker.spawn(async move {
            tokio::time::sleep_until(due).await;
            scheduler.fire(id);
        });

        let mut pending = self.inner.pending.lock();
        match pending.entries.get_mut(&id) {
            Some(entry) => entry.handle = Some(handle.abort_handle()),
            // Already fired, or taken back by shutdown between the two locks.
            None => {
                if pending.closed {
                    handle.abort();
                }
            }
        }

        debug!(retry_id = id, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        Ok(())
    }

    fn fire(&self, id: u64) {
        let Some(entry) = self.inner.pending.lock().entries.remove(&id) else {
            return;
        };

        if let Err(item) = self.inner.queue.try_offer(entry.item) {
            self.inner.ledger.divert(item, LossReason::QueueFull);
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    /// Stops accepting retries, cancels every pending timer and returns the
    /// items that were waiting on them, oldest attempt first.
    pub async fn shutdown(&self) -> Vec<QueuedItem> {
        let entries = {
            let mut pending = self.inner.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.entries)
        };

        let mut cancelled: Vec<(u64, QueuedItem)> = entries
            .into_iter()
            .map(|(id, entry)| {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                (id, entry.item)
            })
            .collect();
        cancelled.sort_by_key(|(id, _)| *id);

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        if !cancelled.is_empty() {
            info!("Cancelled {} pending retries", cancelled.len());
        }

        cancelled.into_iter().map(|(_, item)| item).collect()
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("backoff", &self.inner.backoff)
            .field("pending", &self.pending())
            .finish()
    }
}
