//! The embeddable shipping engine.
//!
//! [`EventShipper::start`] wires the queue, sender pool, retry scheduler,
//! circuit breaker and optional spillover together and returns a cheap,
//! cloneable handle. Application code calls [`EventShipper::log`] from any
//! thread; it never blocks and never fails loudly.

pub mod shutdown;
pub mod signal;

pub use shutdown::ShutdownSummary;

use crate::app::ShipperConfig;
use crate::buffer::EventQueue;
use crate::domain::{Event, QueuedItem, ShipperError};
use crate::reliability::{
    Backoff, CircuitBreaker, Disposition, GaugeReadings, HealthReport, Ledger, LossCallback,
    LossNotifier, LossReason, MetricsError, MetricsSnapshot, RetryScheduler, ShipperMetrics,
    SpillReader, SpilloverControl, SpilloverError,
};
use crate::sender::{InFlight, SenderPool, Transport, WorkerContext, WorkerSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Running,
            1 => Lifecycle::ShuttingDown,
            _ => Lifecycle::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Running => 0,
            Lifecycle::ShuttingDown => 1,
            Lifecycle::Stopped => 2,
        }
    }
}

/// Collaborators supplied by the embedding application.
#[derive(Default, Clone)]
pub struct Capabilities {
    pub transport: Option<Arc<dyn Transport>>,
    pub on_event_loss: Option<LossCallback>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Called with every event that is spilled or dropped. Panics inside the
    /// callback are caught and logged.
    pub fn on_event_loss(
        mut self,
        callback: impl Fn(&Event, LossReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_event_loss = Some(Arc::new(callback));
        self
    }
}

pub(crate) struct ShipperInner {
    config: ShipperConfig,
    lifecycle: AtomicU8,
    // log() calls currently between the lifecycle check and the queue offer
    producers: AtomicUsize,
    queue: Arc<EventQueue>,
    breaker: Arc<CircuitBreaker>,
    scheduler: RetryScheduler,
    ledger: Ledger,
    metrics: Arc<ShipperMetrics>,
    senders: tokio::sync::Mutex<SenderPool>,
    in_flight: Arc<InFlight>,
    spillover: Option<SpilloverControl>,
    summary: OnceCell<ShutdownSummary>,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ShipperInner {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle.as_u8(), Ordering::SeqCst);
    }

    fn gauges(&self) -> GaugeReadings {
        GaugeReadings {
            queue_depth: self.queue.depth(),
            spill_queue_depth: self.ledger.spill_queue_depth(),
            pending_retries: self.scheduler.pending(),
            circuit_open: self.breaker.is_open(),
        }
    }
}

impl Drop for ShipperInner {
    fn drop(&mut self) {
        if self.lifecycle() != Lifecycle::Stopped {
            warn!("EventShipper dropped without shutdown(); queued events are abandoned");
        }
        if let Some(task) = self.signal_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Handle to a running shipper. Clones share the same engine.
#[derive(Clone)]
pub struct EventShipper {
    inner: Arc<ShipperInner>,
}

impl EventShipper {
    /// Validates `config`, then spawns the workers on the current tokio
    /// runtime.
    pub fn start(config: ShipperConfig, capabilities: Capabilities) -> Result<Self, ShipperError> {
        config.validate()?;
        let transport = capabilities
            .transport
            .ok_or(ShipperError::MissingTransport)?;
        Handle::try_current().map_err(|_| ShipperError::NoRuntime)?;

        let metrics = Arc::new(ShipperMetrics::new());
        let notifier = LossNotifier::new(capabilities.on_event_loss);
        let queue = Arc::new(EventQueue::new(config.queue_capacity)?);

        let spillover = match &config.spillover_path {
            Some(path) => Some(SpilloverControl::spawn(
                path,
                config.spillover_capacity,
                Arc::clone(&metrics),
                notifier.clone(),
            )?),
            None => None,
        };

        let ledger = Ledger::new(
            Arc::clone(&metrics),
            notifier,
            spillover.as_ref().map(|control| control.queue().clone()),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_reset(),
        ));
        let scheduler = RetryScheduler::new(
            Backoff::new(config.base_retry_delay(), config.max_retry_delay()),
            Arc::clone(&queue),
            ledger.clone(),
        );

        let in_flight = Arc::new(InFlight::new());
        let senders = SenderPool::start(
            config.sender_threads,
            WorkerContext {
                queue: Arc::clone(&queue),
                transport,
                breaker: Arc::clone(&breaker),
                scheduler: scheduler.clone(),
                ledger: ledger.clone(),
                settings: WorkerSettings {
                    batch_size: config.batch_size,
                    max_batch_wait: config.max_batch_wait(),
                    poll_interval: config.poll_interval(),
                    max_retries: config.max_retries,
                    circuit_open_requeue: config.circuit_open_requeue(),
                },
                in_flight: Arc::clone(&in_flight),
            },
        );

        let register_hook = config.register_shutdown_hook;
        let inner = Arc::new(ShipperInner {
            config,
            lifecycle: AtomicU8::new(Lifecycle::Running.as_u8()),
            producers: AtomicUsize::new(0),
            queue,
            breaker,
            scheduler,
            ledger,
            metrics,
            senders: tokio::sync::Mutex::new(senders),
            in_flight,
            spillover,
            summary: OnceCell::new(),
            signal_task: Mutex::new(None),
        });

        if register_hook {
            let task = signal::spawn_shutdown_hook(Arc::downgrade(&inner));
            *inner.signal_task.lock() = Some(task);
        }

        info!(
            queue_capacity = inner.config.queue_capacity,
            sender_threads = inner.config.sender_threads,
            batch_size = inner.config.batch_size,
            spillover = inner.spillover.is_some(),
            "Event shipper started"
        );

        Ok(Self { inner })
    }

    /// Hands `event` to the shipper without blocking.
    ///
    /// Returns `false` when the event was not accepted for delivery: the
    /// shipper is shutting down, or the queue was full and the event could
    /// not be spilled either. Either way the loss callback is told.
    pub fn log(&self, event: Event) -> bool {
        let inner = &self.inner;
        // Pairs with the SeqCst lifecycle store so shutdown never misses an
        // offer that passed the lifecycle check.
        inner.producers.fetch_add(1, Ordering::SeqCst);
        let accepted = self.offer(event);
        inner.producers.fetch_sub(1, Ordering::SeqCst);
        accepted
    }

    fn offer(&self, event: Event) -> bool {
        let inner = &self.inner;
        if inner.lifecycle() != Lifecycle::Running {
            inner.metrics.record_rejected();
            inner
                .ledger
                .notifier()
                .notify(&event, LossReason::ShutdownInProgress);
            return false;
        }

        inner.metrics.record_queued();
        match inner.queue.try_offer(QueuedItem::new(event)) {
            Ok(()) => true,
            Err(item) => inner.ledger.divert(item, LossReason::QueueFull) == Disposition::Spilled,
        }
    }

    /// Logs each event in turn; returns how many were accepted.
    pub fn log_all<I>(&self, events: I) -> usize
    where
        I: IntoIterator<Item = Event>,
    {
        events
            .into_iter()
            .map(|event| self.log(event))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    pub fn config(&self) -> &ShipperConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(self.inner.gauges())
    }

    pub fn export_metrics(&self) -> Result<String, MetricsError> {
        self.inner.metrics.export_metrics(self.inner.gauges())
    }

    pub fn health(&self) -> HealthReport {
        let gauges = self.inner.gauges();
        HealthReport::evaluate(
            self.inner.lifecycle(),
            gauges.circuit_open,
            gauges.queue_depth,
            self.inner.queue.capacity(),
            self.inner.queue.backpressure_level(),
            gauges.pending_retries,
        )
    }

    /// Number of loss callback invocations that panicked.
    pub fn callback_panics(&self) -> u64 {
        self.inner.ledger.notifier().callback_panics()
    }

    /// Reader over this shipper's spill directory, when spillover is enabled.
    pub fn spill_reader(&self) -> Option<SpillReader> {
        self.inner
            .spillover
            .as_ref()
            .map(|control| SpillReader::new(control.directory()))
    }

    /// Re-logs every event of a spill file and deletes the file once all of
    /// them were accepted. Returns the number of events accepted.
    ///
    /// Pass files from a previous run; replaying the file this shipper is
    /// currently writing would spill the events right back into it.
    pub async fn replay_spill_file(&self, path: &Path) -> Result<usize, SpilloverError> {
        let records = SpillReader::read_records(path).await?;
        let total = records.len();
        let accepted = self.log_all(records.into_iter().map(|record| record.event));

        if accepted == total {
            tokio::fs::remove_file(path).await?;
            info!("Replayed {} events from {}", accepted, path.display());
        } else {
            warn!(
                "Replayed {}/{} events from {}; keeping the file",
                accepted,
                total,
                path.display()
            );
        }
        Ok(accepted)
    }

    /// Stops the shipper and returns the final accounting.
    ///
    /// Safe to call more than once and from several tasks at once: every
    /// caller waits for the same shutdown and receives the same summary.
    pub async fn shutdown(&self) -> ShutdownSummary {
        shutdown::shutdown(&self.inner).await
    }
}

impl std::fmt::Debug for EventShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventShipper")
            .field("lifecycle", &self.lifecycle())
            .field("queue", &self.inner.queue)
            .field("breaker", &self.inner.breaker)
            .field("spillover", &self.inner.spillover)
            .finish()
    }
}
