//! Sender workers.
//!
//! Each worker pulls one item, tops it up into a batch, and decides every
//! item's fate from the transport outcome: delivered, re-scheduled through the
//! retry scheduler, or diverted to spillover or failure through the ledger.

use super::transport::{DeliveryError, Transport};
use crate::buffer::EventQueue;
use crate::domain::{Event, QueuedItem};
use crate::reliability::{CircuitBreaker, Ledger, LossReason, RetryScheduler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub max_batch_wait: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Re-schedule delay for items short-circuited while the circuit is open
    /// and spillover is disabled.
    pub circuit_open_requeue: Duration,
}

/// Items taken off the queue whose outcome is not yet decided, per worker.
///
/// An item is registered in the same poll that takes it off the queue and
/// settled in the same poll that hands it to the ledger, the scheduler or the
/// sent counter, so an aborted worker leaves exactly its undecided items here.
#[derive(Debug, Default)]
pub struct InFlight {
    items: Mutex<HashMap<usize, Vec<QueuedItem>>>,
    count: AtomicUsize,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self, worker: usize, item: &QueuedItem) {
        self.items.lock().entry(worker).or_default().push(item.clone());
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn settle(&self, worker: usize, item: &QueuedItem) {
        let mut items = self.items.lock();
        let Some(held) = items.get_mut(&worker) else {
            return;
        };
        if let Some(position) = held
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate.event(), item.event()))
        {
            held.swap_remove(position);
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every item still registered.
    pub fn abandon(&self) -> Vec<QueuedItem> {
        let mut items = self.items.lock();
        let abandoned: Vec<QueuedItem> = items.drain().flat_map(|(_, held)| held).collect();
        self.count.store(0, Ordering::Release);
        abandoned
    }
}

/// State shared by every worker of one shipper.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<EventQueue>,
    pub transport: Arc<dyn Transport>,
    pub breaker: Arc<CircuitBreaker>,
    pub scheduler: RetryScheduler,
    pub ledger: Ledger,
    pub settings: WorkerSettings,
    pub in_flight: Arc<InFlight>,
}

pub struct SenderWorker {
    id: usize,
    context: WorkerContext,
    cancel: CancellationToken,
}

impl SenderWorker {
    pub fn new(id: usize, context: WorkerContext, cancel: CancellationToken) -> Self {
        Self {
            id,
            context,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        debug!(worker = self.id, "Sender worker started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = self.context.queue.poll(self.context.settings.poll_interval) => item,
            };

            let Some(item) = polled else {
                continue;
            };
            self.context.in_flight.take(self.id, &item);
            self.process(item).await;
        }

        debug!(worker = self.id, "Sender worker stopped");
    }

    /// Takes ownership of `item` (already registered in flight) and resolves
    /// it together with whatever else is waiting in the queue.
    async fn process(&self, item: QueuedItem) {
        if !self.context.breaker.allow_request() {
            self.short_circuit(item);
            return;
        }

        let settings = self.context.settings;
        let mut batch = vec![item];
        if settings.batch_size > 1 {
            let in_flight = &self.context.in_flight;
            self.context
                .queue
                .fill_batch(
                    &mut batch,
                    settings.batch_size,
                    settings.max_batch_wait,
                    |taken| in_flight.take(self.id, taken),
                )
                .await;
        }

        if batch.len() == 1 {
            if let Some(item) = batch.pop() {
                self.send_single(item).await;
            }
        } else {
            self.send_batch(batch).await;
        }
    }

    async fn send_single(&self, item: QueuedItem) {
        match self.context.transport.send_one(item.event()).await {
            Ok(()) => {
                self.context.breaker.record_success();
                self.delivered(std::slice::from_ref(&item));
            }
            Err(error) => self.handle_failure(item, error),
        }
    }

    async fn send_batch(&self, batch: Vec<QueuedItem>) {
        let events: Vec<Arc<Event>> = batch.iter().map(|item| Arc::clone(item.event())).collect();

        match self.context.transport.send_batch(&events).await {
            Ok(report) if report.is_complete() => {
                self.context.breaker.record_success();
                debug!(worker = self.id, "Batch of {} events delivered", batch.len());
                self.delivered(&batch);
            }
            Ok(report) => {
                self.context.breaker.record_success();
                let mut errors: Vec<Option<DeliveryError>> = vec![None; batch.len()];
                for (index, error) in report.rejected {
                    if let Some(slot) = errors.get_mut(index) {
                        *slot = Some(error);
                    }
                }

                let mut delivered = Vec::with_capacity(batch.len());
                for (item, error) in batch.into_iter().zip(errors) {
                    match error {
                        Some(error) => self.handle_failure(item, error),
                        None => delivered.push(item),
                    }
                }
                debug!(
                    worker = self.id,
                    delivered = delivered.len(),
                    "Batch partially accepted by endpoint"
                );
                self.delivered(&delivered);
            }
            Err(error) => {
                debug!(
                    worker = self.id,
                    "Batch of {} failed ({}); falling back to individual sends",
                    batch.len(),
                    error
                );
                for item in batch {
                    if self.context.breaker.allow_request() {
                        self.send_single(item).await;
                    } else {
                        self.short_circuit(item);
                    }
                }
            }
        }
    }

    /// Circuit open: park the item without touching the network.
    fn short_circuit(&self, item: QueuedItem) {
        let context = &self.context;
        context.in_flight.settle(self.id, &item);
        if context.ledger.has_spillover() {
            context.ledger.divert(item, LossReason::CircuitOpen);
        } else if let Err(item) = context
            .scheduler
            .schedule_after(item, context.settings.circuit_open_requeue)
        {
            context.ledger.drop_item(&item, LossReason::RetryRejected);
        }
    }

    fn handle_failure(&self, item: QueuedItem, error: DeliveryError) {
        let context = &self.context;
        context.in_flight.settle(self.id, &item);

        if error.is_retryable() {
            if context.breaker.record_failure() {
                warn!(
                    worker = self.id,
                    "Circuit breaker opened after repeated failures: {}", error
                );
            }

            if item.attempts() < context.settings.max_retries {
                let retry = item.next_attempt();
                match context.scheduler.schedule_retry(retry) {
                    Ok(delay) => debug!(
                        event_id = %item.event().event_id,
                        attempt = item.attempts() + 1,
                        "Retrying in {:?} after: {}", delay, error
                    ),
                    Err(retry) => context.ledger.drop_item(&retry, LossReason::RetryRejected),
                }
            } else {
                debug!(event_id = %item.event().event_id, "Retries exhausted: {}", error);
                context.ledger.divert(item, LossReason::RetriesExhausted);
            }
        } else {
            debug!(event_id = %item.event().event_id, "Non-retryable failure: {}", error);
            context.ledger.divert(item, LossReason::NonRetryable);
        }
    }

    fn delivered(&self, items: &[QueuedItem]) {
        if items.is_empty() {
            return;
        }
        for item in items {
            self.context.in_flight.settle(self.id, item);
        }
        self.context.ledger.delivered(items.len() as u64);
    }
}

/// Fixed-size pool of sender workers sharing one cancellation token.
pub struct SenderPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl SenderPool {
    pub fn start(threads: usize, context: WorkerContext) -> Self {
        let cancel = CancellationToken::new();
        let in_flight = Arc::clone(&context.in_flight);
        let handles = (0..threads.max(1))
            .map(|id| SenderWorker::new(id, context.clone(), cancel.child_token()).spawn())
            .collect();

        info!("Started {} sender workers", threads.max(1));

        Self {
            cancel,
            handles,
            in_flight,
        }
    }

    /// Signals every worker and waits up to `grace` for in-flight sends to
    /// finish. Returns the items whose send was abandoned.
    pub async fn stop(&mut self, grace: Duration) -> Vec<QueuedItem> {
        self.cancel.cancel();

        let mut handles = std::mem::take(&mut self.handles);

        if tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            warn!(
                "Sender workers did not stop within {:?}; aborting in-flight sends",
                grace
            );
            for handle in &handles {
                handle.abort();
            }
            // Aborted workers must be gone before their items are handed back.
            while handles.iter().any(|handle| !handle.is_finished()) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        self.in_flight.abandon()
    }
}

impl Drop for SenderPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
