use super::event::Event;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bookkeeping wrapper around an event while it is owned by the shipper.
///
/// Items are never mutated in place. A retry builds a fresh item through
/// [`QueuedItem::next_attempt`], so a worker holding one copy can never race
/// with the scheduler re-queuing another.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    event: Arc<Event>,
    attempts: u32,
    first_enqueued_at: Instant,
}

impl QueuedItem {
    pub fn new(event: Event) -> Self {
        Self {
            event: Arc::new(event),
            attempts: 0,
            first_enqueued_at: Instant::now(),
        }
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    /// Number of failed delivery attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time since the event was first queued, across retries.
    pub fn age(&self) -> Duration {
        self.first_enqueued_at.elapsed()
    }

    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            event: Arc::clone(&self.event),
            attempts: self.attempts.saturating_add(1),
            first_enqueued_at: self.first_enqueued_at,
        }
    }
}
