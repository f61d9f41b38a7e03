#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rask_event_shipper::sender::{BatchOutcome, BatchReport, DeliveryError, Outcome, Transport};
use rask_event_shipper::{Event, LossReason, ShipperConfig};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

type OneFn = Box<dyn Fn(&Event, usize) -> Outcome + Send + Sync>;
type BatchFn = Box<dyn Fn(&[Arc<Event>]) -> BatchOutcome + Send + Sync>;

/// Transport whose answers are scripted by closures. The closure for single
/// sends also receives the 0-based index of the call.
pub struct ScriptedTransport {
    on_one: OneFn,
    on_batch: BatchFn,
    gate: Option<Arc<Semaphore>>,
    pub entered: Arc<Notify>,
    single_calls: Mutex<Vec<String>>,
    batch_calls: Mutex<Vec<usize>>,
    call_count: AtomicUsize,
}

impl ScriptedTransport {
    pub fn succeeding() -> Self {
        Self::with_one(|_, _| Ok(()))
    }

    pub fn failing(error: DeliveryError) -> Self {
        let batch_error = error.clone();
        Self::with_one(move |_, _| Err(error.clone()))
            .on_batch(move |_| Err(batch_error.clone()))
    }

    pub fn with_one(f: impl Fn(&Event, usize) -> Outcome + Send + Sync + 'static) -> Self {
        Self {
            on_one: Box::new(f),
            on_batch: Box::new(|_| Ok(BatchReport::accepted())),
            gate: None,
            entered: Arc::new(Notify::new()),
            single_calls: Mutex::new(Vec::new()),
            batch_calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn on_batch(
        mut self,
        f: impl Fn(&[Arc<Event>]) -> BatchOutcome + Send + Sync + 'static,
    ) -> Self {
        self.on_batch = Box::new(f);
        self
    }

    /// Every send waits for a permit on `gate` before answering.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn single_calls(&self) -> Vec<String> {
        self.single_calls.lock().clone()
    }

    pub fn batch_calls(&self) -> Vec<usize> {
        self.batch_calls.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_one(&self, event: &Event) -> Outcome {
        self.pass_gate().await;
        let index = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.single_calls.lock().push(event.name.clone());
        (self.on_one)(event, index)
    }

    async fn send_batch(&self, events: &[Arc<Event>]) -> BatchOutcome {
        self.pass_gate().await;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.batch_calls.lock().push(events.len());
        (self.on_batch)(events)
    }
}

/// Records every loss callback invocation.
#[derive(Clone, Default)]
pub struct LossLog {
    entries: Arc<Mutex<Vec<(String, LossReason)>>>,
}

impl LossLog {
    pub fn callback(&self) -> impl Fn(&Event, LossReason) + Send + Sync + 'static {
        let entries = Arc::clone(&self.entries);
        move |event, reason| entries.lock().push((event.name.clone(), reason))
    }

    pub fn entries(&self) -> Vec<(String, LossReason)> {
        self.entries.lock().clone()
    }

    pub fn reasons_for(&self, name: &str) -> Vec<LossReason> {
        self.entries
            .lock()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, reason)| *reason)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub fn event(name: &str) -> Event {
    Event::new(name, serde_json::json!({ "source": "test" }))
}

pub fn server_error() -> DeliveryError {
    DeliveryError::Server {
        status: 503,
        code: None,
        message: Some("unavailable".to_string()),
    }
}

pub fn client_error() -> DeliveryError {
    DeliveryError::Client {
        status: 400,
        code: Some("INVALID_EVENT".to_string()),
        message: None,
    }
}

/// Small, fast settings suitable for tests.
pub fn test_config() -> ShipperConfig {
    ShipperConfig {
        queue_capacity: 64,
        sender_threads: 1,
        batch_size: 1,
        max_batch_wait_ms: 5,
        max_retries: 3,
        base_retry_delay_ms: 10,
        max_retry_delay_ms: 40,
        circuit_breaker_threshold: 100,
        circuit_breaker_reset_ms: 30_000,
        spillover_path: None,
        spillover_capacity: 64,
        register_shutdown_hook: false,
        poll_interval_ms: 5,
        circuit_open_requeue_ms: 20,
        drain_timeout_ms: 2_000,
        sender_stop_timeout_ms: 1_000,
        spill_flush_timeout_ms: 1_000,
    }
}

pub fn with_spillover(mut config: ShipperConfig, dir: &Path) -> ShipperConfig {
    config.spillover_path = Some(dir.to_path_buf());
    config
}

/// Polls `condition` until it holds, failing the test after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future)
        .await
        .expect("operation timed out")
}
