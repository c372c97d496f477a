// src/upload/worker.rs
//! Upload worker
//!
//! Drains the approved area of one store through an [`Uploader`], oldest batch
//! first, on a timer driven by [`UploadScheduler`].
//!
//! A batch is deleted only after the uploader reports success (or a permanent
//! rejection). A crash between the two leaves the batch on disk, so it is sent
//! again after restart: delivery is at-least-once.

use crate::observability::names;
use crate::recording::storage::{BatchFileStore, BatchRef, RetentionArea};
use crate::runtime::retry::RetryRunner;
use crate::upload::scheduler::{CycleOutcome, UploadScheduler};
use crate::upload::uploader::{UploadOutcome, Uploader};
use crate::utils::errors::{QueueError, Result, Retryable};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on batches handled in one cycle
    pub max_batches_per_cycle: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_batches_per_cycle: 5,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_batches_per_cycle == 0 {
            return Err("max_batches_per_cycle cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Lifecycle of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the next cycle
    Idle,

    /// A cycle is in progress
    Running,

    /// Waiting after a failed cycle
    Backoff,

    /// Shut down; no further cycles
    Stopped,
}

/// Upload statistics
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub cycles: u64,
    pub batches_uploaded: u64,
    pub batches_rejected: u64,
    pub batches_corrupt: u64,
    pub upload_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    cycles: AtomicU64,
    batches_uploaded: AtomicU64,
    batches_rejected: AtomicU64,
    batches_corrupt: AtomicU64,
    upload_failures: AtomicU64,
}

/// What happened to one leased batch
enum BatchResult {
    /// Uploaded and deleted
    Uploaded,

    /// Deleted without a successful upload (corrupt, empty, rejected)
    Discarded,

    /// Left in place; the cycle should stop
    Failed,
}

struct WorkerInner {
    store: Arc<BatchFileStore>,
    uploader: Arc<dyn Uploader>,
    config: WorkerConfig,
    retry: RetryRunner,
    cancel: CancellationToken,
    state: RwLock<WorkerState>,
    stats: StatsCounters,
}

/// Background uploader for one store
pub struct UploadWorker {
    inner: Arc<WorkerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UploadWorker {
    pub fn new(
        store: Arc<BatchFileStore>,
        uploader: Arc<dyn Uploader>,
        config: WorkerConfig,
        retry: RetryRunner,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                uploader,
                config,
                retry,
                cancel,
                state: RwLock::new(WorkerState::Idle),
                stats: StatsCounters::default(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the timer loop; calling it again while running has no effect
    pub fn start(&self, mut scheduler: UploadScheduler) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        info!(
            "Upload worker for {:?} starting, first cycle in {:?}",
            inner.store.area_id(),
            scheduler.current_delay()
        );

        *handle = Some(tokio::spawn(async move {
            loop {
                let delay = scheduler.current_delay();
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let outcome = inner.run_cycle().await;
                let next = scheduler.on_outcome(outcome);
                debug!(
                    "Upload cycle for {:?} ended {:?}, next in {:?}",
                    inner.store.area_id(),
                    outcome,
                    next
                );
            }

            inner.set_state(WorkerState::Stopped);
            debug!("Upload worker for {:?} stopped", inner.store.area_id());
        }));
    }

    /// Run one cycle right away
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.read()
    }

    pub fn store(&self) -> &Arc<BatchFileStore> {
        &self.inner.store
    }

    pub fn stats(&self) -> UploadStats {
        let s = &self.inner.stats;
        UploadStats {
            cycles: s.cycles.load(Ordering::Relaxed),
            batches_uploaded: s.batches_uploaded.load(Ordering::Relaxed),
            batches_rejected: s.batches_rejected.load(Ordering::Relaxed),
            batches_corrupt: s.batches_corrupt.load(Ordering::Relaxed),
            upload_failures: s.upload_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop scheduling cycles; an in-flight upload is allowed to finish
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Upload worker task ended abnormally: {}", e);
                }
            }
            None => self.inner.set_state(WorkerState::Stopped),
        }
    }
}

impl WorkerInner {
    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    async fn run_cycle(&self) -> CycleOutcome {
        if self.cancel.is_cancelled() {
            return CycleOutcome::Drained;
        }

        self.set_state(WorkerState::Running);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let outcome = self.drain().await;

        self.set_state(match outcome {
            CycleOutcome::Failed => WorkerState::Backoff,
            _ => WorkerState::Idle,
        });
        outcome
    }

    async fn drain(&self) -> CycleOutcome {
        for _ in 0..self.config.max_batches_per_cycle {
            if self.cancel.is_cancelled() {
                return CycleOutcome::Drained;
            }

            let batch = match self.blocking(|store| store.lease_oldest(RetentionArea::Approved)).await {
                Ok(Some(batch)) => batch,
                Ok(None) => return CycleOutcome::Drained,
                Err(err) => {
                    warn!("Listing approved batches of {:?} failed: {}", self.store.area_id(), err);
                    return CycleOutcome::Failed;
                }
            };

            if let BatchResult::Failed = self.process(batch).await {
                return CycleOutcome::Failed;
            }
        }

        let remaining = self
            .blocking(|store| {
                let batches = store.list_closed_batches(RetentionArea::Approved)?;
                Ok(batches.iter().any(|b| !store.is_leased(b)))
            })
            .await;

        match remaining {
            Ok(true) => CycleOutcome::MoreRemaining,
            Ok(false) => CycleOutcome::Drained,
            Err(_) => CycleOutcome::MoreRemaining,
        }
    }

    async fn process(&self, batch: BatchRef) -> BatchResult {
        let read = {
            let batch = batch.clone();
            self.blocking(move |store| store.read_batch(&batch)).await
        };

        let contents = match read {
            Ok(contents) => contents,
            Err(err @ QueueError::CorruptData { .. }) => {
                warn!("Dropping corrupt batch {}: {}", batch.id(), err);
                self.stats.batches_corrupt.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::BATCHES_CORRUPT).increment(1);
                return self.discard(&batch).await;
            }
            Err(err) if err.is_retryable() || matches!(err, QueueError::Task(_)) => {
                warn!("Reading batch {} failed, will retry: {}", batch.id(), err);
                self.store.release(&batch);
                return BatchResult::Failed;
            }
            Err(err) => {
                warn!("Dropping unreadable batch {}: {}", batch.id(), err);
                return self.discard(&batch).await;
            }
        };

        if contents.events.is_empty() {
            debug!("Batch {} is empty; deleting without upload", batch.id());
            return self.discard(&batch).await;
        }

        let uploader = Arc::clone(&self.uploader);
        let event_count = contents.events.len();
        let outcome = tokio::task::spawn_blocking(move || {
            uploader.upload(&contents.events, contents.metadata.as_deref())
        })
        .await
        .unwrap_or_else(|e| UploadOutcome::RetryableFailure(format!("uploader task failed: {}", e)));

        match outcome.into_result() {
            Ok(()) => {
                debug!("Uploaded batch {} ({} events)", batch.id(), event_count);
                self.stats.batches_uploaded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::BATCHES_UPLOADED).increment(1);
                self.remove(&batch).await;
                BatchResult::Uploaded
            }
            Err(err) if err.is_retryable() => {
                info!("Batch {} not uploaded, backing off: {}", batch.id(), err);
                self.stats.upload_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::UPLOAD_FAILURES).increment(1);
                self.store.release(&batch);
                BatchResult::Failed
            }
            Err(err) => {
                warn!("Batch {} dropped: {}", batch.id(), err);
                self.stats.batches_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(names::BATCHES_REJECTED).increment(1);
                self.discard(&batch).await
            }
        }
    }

    async fn discard(&self, batch: &BatchRef) -> BatchResult {
        self.remove(batch).await;
        BatchResult::Discarded
    }

    /// Delete under the retry policy; on final failure the lease is dropped
    /// so a later cycle can pick the batch up again
    async fn remove(&self, batch: &BatchRef) {
        let result = self
            .retry
            .retry("batch delete", || {
                let batch = batch.clone();
                self.blocking(move |store| store.delete_batch(&batch))
            })
            .await;

        if let Err(err) = result {
            error!("Could not delete batch {}: {}", batch.id(), err);
            self.store.release(batch);
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&BatchFileStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }
}
