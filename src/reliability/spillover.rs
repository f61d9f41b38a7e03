//! Durable overflow path.
//!
//! Producers, workers and the retry scheduler hand items to a bounded
//! [`SpilloverQueue`] without touching the disk. A single writer task drains
//! it into an append-only NDJSON file, so slow disks never stall the caller
//! or the senders.

use super::loss::{LossNotifier, LossReason};
use super::metrics::ShipperMetrics;
use crate::domain::{Event, QueuedItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SPILL_FILE_PREFIX: &str = "spill-";
const SPILL_FILE_SUFFIX: &str = ".ndjson";
// Same allocation guard as the event queue
const MAX_CAPACITY: usize = 100_000_000;

#[derive(Error, Debug)]
pub enum SpilloverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid spillover path: {0}")]
    InvalidPath(String),
    #[error("Invalid spillover capacity: {0}")]
    InvalidCapacity(usize),
}

/// One line of a spill file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpillRecord {
    pub spilled_at: DateTime<Utc>,
    pub reason: LossReason,
    pub attempts: u32,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct SpillEntry {
    pub item: QueuedItem,
    pub reason: LossReason,
}

#[derive(Debug, Default)]
struct SpillState {
    // entries sitting in the channel
    depth: AtomicUsize,
    // entries accepted but not yet written or counted failed
    outstanding: AtomicUsize,
    // the entry the writer is appending right now
    writing: parking_lot::Mutex<Option<SpillEntry>>,
    closed: AtomicBool,
}

/// Producer side of the spillover path. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SpilloverQueue {
    sender: mpsc::Sender<SpillEntry>,
    state: Arc<SpillState>,
    capacity: usize,
}

impl SpilloverQueue {
    /// Non-blocking hand-off. Returns the item when the queue is full or
    /// closed.
    pub fn try_offer(&self, item: QueuedItem, reason: LossReason) -> Result<(), QueuedItem> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(item);
        }

        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        self.state.depth.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(SpillEntry { item, reason }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(entry))
            | Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.state.depth.fetch_sub(1, Ordering::AcqRel);
                self.state.outstanding.fetch_sub(1, Ordering::AcqRel);
                Err(entry.item)
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

/// Owns the spill writer task and stops it at shutdown.
pub struct SpilloverControl {
    queue: SpilloverQueue,
    directory: PathBuf,
    receiver: Arc<Mutex<mpsc::Receiver<SpillEntry>>>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<ShipperMetrics>,
    notifier: LossNotifier,
}

impl SpilloverControl {
    /// Creates the spill directory (if missing) and starts the writer task on
    /// the current tokio runtime.
    pub fn spawn(
        directory: &Path,
        capacity: usize,
        metrics: Arc<ShipperMetrics>,
        notifier: LossNotifier,
    ) -> Result<Self, SpilloverError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(SpilloverError::InvalidCapacity(capacity));
        }
        if directory.as_os_str().is_empty() {
            return Err(SpilloverError::InvalidPath("empty path".to_string()));
        }
        std::fs::create_dir_all(directory)?;
        if !directory.is_dir() {
            return Err(SpilloverError::InvalidPath(format!(
                "{} is not a directory",
                directory.display()
            )));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        let state = Arc::new(SpillState::default());
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();

        let writer = SpillWriter {
            directory: directory.to_path_buf(),
            file: None,
            state: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            notifier: notifier.clone(),
        };
        let handle = tokio::spawn(writer.run(Arc::clone(&receiver), cancel.clone()));

        info!("Spillover enabled at {}", directory.display());

        Ok(Self {
            queue: SpilloverQueue {
                sender,
                state,
                capacity,
            },
            directory: directory.to_path_buf(),
            receiver,
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
            metrics,
            notifier,
        })
    }

    pub fn queue(&self) -> &SpilloverQueue {
        &self.queue
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Closes the intake, lets the writer flush what it already holds for up
    /// to `grace`, then counts anything left over as failed.
    pub async fn stop(&self, grace: Duration) {
        self.queue.close();
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let abort_handle = handle.abort_handle();
            match timeout(grace, handle).await {
                Ok(Ok(())) => debug!("Spillover writer flushed and stopped"),
                Ok(Err(e)) => error!("Spillover writer task failed: {}", e),
                Err(_) => {
                    warn!("Spillover flush grace period of {:?} exceeded", grace);
                    abort_handle.abort();
                }
            }
        }

        self.abandon_remaining().await;
    }

    async fn abandon_remaining(&self) {
        // An aborted writer releases the receiver once its future is dropped.
        let mut receiver = self.receiver.lock().await;
        let mut abandoned = 0u64;
        while let Ok(entry) = receiver.try_recv() {
            self.queue.state.depth.fetch_sub(1, Ordering::AcqRel);
            self.queue.state.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_failed(1);
            self.notifier
                .notify(entry.item.event(), LossReason::SpilloverAbandoned);
            abandoned += 1;
        }

        // Entries the writer had taken but never finished.
        let interrupted = self.queue.state.writing.lock().take();
        let stranded = self.queue.state.outstanding.swap(0, Ordering::AcqRel) as u64;
        if stranded > 0 {
            self.metrics.record_failed(stranded);
        }
        if let Some(entry) = interrupted {
            self.notifier
                .notify(entry.item.event(), LossReason::SpilloverAbandoned);
        }

        if abandoned + stranded > 0 {
            error!(
                abandoned,
                stranded, "Spillover stopped with unwritten events; counted as failed"
            );
        }
    }
}

impl Drop for SpilloverControl {
    fn drop(&mut self) {
        self.queue.close();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SpilloverControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpilloverControl")
            .field("directory", &self.directory)
            .field("queue", &self.queue)
            .finish()
    }
}

struct SpillWriter {
    directory: PathBuf,
    file: Option<File>,
    state: Arc<SpillState>,
    metrics: Arc<ShipperMetrics>,
    notifier: LossNotifier,
}

impl SpillWriter {
    async fn run(
        mut self,
        receiver: Arc<Mutex<mpsc::Receiver<SpillEntry>>>,
        cancel: CancellationToken,
    ) {
        let mut receiver = receiver.lock().await;

        loop {
            tokio::select! {
                biased;
                entry = receiver.recv() => match entry {
                    Some(entry) => self.write(entry).await,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        // Flush whatever was handed over before the stop signal.
        while let Ok(entry) = receiver.try_recv() {
            self.write(entry).await;
        }

        if let Some(file) = self.file.take()
            && let Err(e) = file.sync_all().await
        {
            error!("Failed to sync spill file: {}", e);
        }
    }

    async fn write(&mut self, entry: SpillEntry) {
        self.state.depth.fetch_sub(1, Ordering::AcqRel);

        let record = SpillRecord {
            spilled_at: Utc::now(),
            reason: entry.reason,
            attempts: entry.item.attempts(),
            event: entry.item.event().as_ref().clone(),
        };

        *self.state.writing.lock() = Some(entry);
        let appended = self.append(&record).await;
        self.state.writing.lock().take();

        match appended {
            Ok(()) => self.metrics.record_spilled(1),
            Err(e) => {
                error!(
                    event_id = %record.event.event_id,
                    "Failed to write event to spill file: {}", e
                );
                // Start a fresh file on the next write.
                self.file = None;
                self.metrics.record_failed(1);
                self.notifier
                    .notify(&record.event, LossReason::SpilloverWriteFailed);
            }
        }

        self.state.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    async fn append(&mut self, record: &SpillRecord) -> Result<(), SpilloverError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if self.file.is_none() {
            let path = self.directory.join(spill_file_name(Utc::now()));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!("Opened spill file {}", path.display());
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

fn spill_file_name(now: DateTime<Utc>) -> String {
    format!(
        "{SPILL_FILE_PREFIX}{}-{}{SPILL_FILE_SUFFIX}",
        now.format("%Y%m%dT%H%M%S%.6fZ"),
        std::process::id()
    )
}

fn is_spill_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(SPILL_FILE_PREFIX) && name.ends_with(SPILL_FILE_SUFFIX))
}

/// Reads spill files back, for replay or inspection.
#[derive(Debug, Clone)]
pub struct SpillReader {
    directory: PathBuf,
}

impl SpillReader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Spill files in the directory, oldest first.
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, SpilloverError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.directory).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_spill_file(&path) {
                files.push(path);
            }
        }

        // Names embed the UTC timestamp, so lexical order is creation order.
        files.sort();
        Ok(files)
    }

    /// Parses every record of a spill file, skipping lines that do not parse.
    pub async fn read_records(path: &Path) -> Result<Vec<SpillRecord>, SpilloverError> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_number = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SpillRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping malformed spill record {}:{}: {}",
                    path.display(),
                    line_number,
                    e
                ),
            }
        }

        Ok(records)
    }

    pub async fn read_all(&self) -> Result<Vec<SpillRecord>, SpilloverError> {
        let mut records = Vec::new();
        for path in self.list_files().await? {
            records.extend(Self::read_records(&path).await?);
        }
        Ok(records)
    }

    /// Deletes spill files last modified longer than `retention` ago.
    pub async fn cleanup_older_than(&self, retention: Duration) -> Result<u32, SpilloverError> {
        let now = SystemTime::now();
        let mut deleted_count = 0;

        for path in self.list_files().await? {
            let modified = fs::metadata(&path).await?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > retention && fs::remove_file(&path).await.is_ok() {
                deleted_count += 1;
            }
        }

        if deleted_count > 0 {
            info!("Cleaned up {deleted_count} old spill files");
        }

        Ok(deleted_count)
    }
}
