use super::backpressure::BackpressureLevel;
use crate::domain::QueuedItem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, timeout, timeout_at};

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),
}

// Prevent excessive memory allocation
const MAX_CAPACITY: usize = 100_000_000;

/// Bounded FIFO between producers and the sender workers.
///
/// Insertion never waits: a full queue hands the item straight back to the
/// caller. The receiving half sits behind an async mutex so any number of
/// workers can poll it; the mutex is only ever held while waiting on the
/// channel, never across a send.
pub struct EventQueue {
    sender: mpsc::Sender<QueuedItem>,
    receiver: Mutex<mpsc::Receiver<QueuedItem>>,
    capacity: usize,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(BufferError::InvalidCapacity(capacity));
        }

        let (sender, receiver) = mpsc::channel(capacity);

        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Non-blocking insertion. Returns the item when the queue is full.
    pub fn try_offer(&self, item: QueuedItem) -> Result<(), QueuedItem> {
        // Reserve before sending so a racing receiver can never drive the
        // gauge below zero.
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        match self.sender.try_send(item) {
            Ok(()) => {
                self.update_peak_depth(depth);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item))
            | Err(mpsc::error::TrySendError::Closed(item)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(item)
            }
        }
    }

    /// Waits up to `wait` for the next item.
    pub async fn poll(&self, wait: Duration) -> Option<QueuedItem> {
        let received = timeout(wait, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        match received {
            Ok(Some(item)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Some(item)
            }
            _ => None,
        }
    }

    /// Opportunistically tops `batch` up to `max_size` items, waiting at most
    /// `max_wait` in total for stragglers. `on_take` sees each item as it
    /// leaves the channel, before the next wait.
    pub async fn fill_batch(
        &self,
        batch: &mut Vec<QueuedItem>,
        max_size: usize,
        max_wait: Duration,
        mut on_take: impl FnMut(&QueuedItem),
    ) {
        let deadline = Instant::now() + max_wait;
        let Ok(mut receiver) = timeout_at(deadline, self.receiver.lock()).await else {
            return;
        };

        while batch.len() < max_size {
            // timeout_at polls the channel once before checking the deadline,
            // so already-queued items are always picked up.
            match timeout_at(deadline, receiver.recv()).await {
                Ok(Some(item)) => {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    on_take(&item);
                    batch.push(item);
                }
                _ => break,
            }
        }
    }

    /// Removes everything currently queued without waiting.
    pub async fn drain(&self) -> Vec<QueuedItem> {
        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            drained.push(item);
        }
        drained
    }

    pub fn fill_ratio(&self) -> f64 {
        self.depth() as f64 / self.capacity as f64
    }

    pub fn backpressure_level(&self) -> BackpressureLevel {
        BackpressureLevel::from_fill_ratio(self.fill_ratio())
    }

    fn update_peak_depth(&self, current: usize) {
        let mut peak = self.peak_depth.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_depth.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => peak = x,
            }
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.capacity)
            .field("depth", &self.depth())
            .field("peak_depth", &self.peak_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;

    fn item(name: &str) -> QueuedItem {
        QueuedItem::new(Event::new(name, serde_json::Value::Null))
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            EventQueue::new(0),
            Err(BufferError::InvalidCapacity(0))
        ));
    }

    #[tokio::test]
    async fn full_queue_hands_item_back() {
        let queue = EventQueue::new(2).unwrap();
        assert!(queue.try_offer(item("a")).is_ok());
        assert!(queue.try_offer(item("b")).is_ok());

        let rejected = queue.try_offer(item("c")).unwrap_err();
        assert_eq!(rejected.event().name, "c");
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.peak_depth(), 2);
    }

    #[tokio::test]
    async fn poll_preserves_fifo_and_updates_depth() {
        let queue = EventQueue::new(4).unwrap();
        queue.try_offer(item("a")).unwrap();
        queue.try_offer(item("b")).unwrap();

        let first = queue.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.event().name, "a");
        assert_eq!(queue.depth(), 1);

        let second = queue.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.event().name, "b");
        assert!(queue.poll(Duration::from_millis(10)).await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fill_batch_stops_at_max_size() {
        let queue = EventQueue::new(10).unwrap();
        for i in 0..5 {
            queue.try_offer(item(&format!("e{i}"))).unwrap();
        }

        let mut batch = Vec::new();
        let mut taken = Vec::new();
        queue
            .fill_batch(&mut batch, 3, Duration::from_millis(5), |item| {
                taken.push(item.event().name.clone())
            })
            .await;

        assert_eq!(batch.len(), 3);
        assert_eq!(taken, vec!["e0", "e1", "e2"]);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.drain().await.len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fill_batch_gives_up_after_max_wait() {
        let queue = EventQueue::new(10).unwrap();
        let mut batch = vec![item("first")];

        let start = std::time::Instant::now();
        queue
            .fill_batch(&mut batch, 8, Duration::from_millis(20), |_| {})
            .await;

        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn backpressure_level_tracks_fill_ratio() {
        let queue = EventQueue::new(4).unwrap();
        assert_eq!(queue.backpressure_level(), BackpressureLevel::None);
        for i in 0..4 {
            queue.try_offer(item(&format!("e{i}"))).unwrap();
        }
        assert_eq!(queue.backpressure_level(), BackpressureLevel::High);
    }
}
