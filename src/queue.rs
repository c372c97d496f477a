// src/queue.rs
//! Queue facade
//!
//! Wires one consent controller, a batch store per area id, the consent
//! migrator, and an upload worker per area that has an uploader.

use crate::consent::{ConsentController, ConsentState};
use crate::migration::{ConsentMigrator, MigrationStats};
use crate::recording::recorder::{EventRecorder, Serializer};
use crate::recording::storage::{BatchFileStore, RawEvent, WriteStatus};
use crate::runtime::retry::RetryRunner;
use crate::upload::scheduler::{CycleOutcome, UploadScheduler};
use crate::upload::uploader::Uploader;
use crate::upload::worker::{UploadStats, UploadWorker};
use crate::utils::config::QueueConfig;
use crate::utils::errors::{QueueError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Snapshot of queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub migration: MigrationStats,
    pub uploads: HashMap<String, UploadStats>,
}

/// Consent-governed event queue
pub struct TelemetryQueue {
    config: QueueConfig,
    consent: Arc<ConsentController>,
    stores: HashMap<String, Arc<BatchFileStore>>,
    migrator: Arc<ConsentMigrator>,
    workers: HashMap<String, UploadWorker>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl TelemetryQueue {
    /// Open every configured area and start background tasks
    ///
    /// Must be called inside a tokio runtime. Areas without an entry in
    /// `uploaders` keep their data on disk until an uploader is configured.
    pub fn start(config: QueueConfig, uploaders: HashMap<String, Arc<dyn Uploader>>) -> Result<Self> {
        config.validate()?;

        if let Some(unknown) = uploaders.keys().find(|k| !config.storage.areas.contains(*k)) {
            return Err(QueueError::Config(format!(
                "uploader given for unknown area {:?}",
                unknown
            )));
        }

        let consent = Arc::new(ConsentController::new(config.initial_consent));

        let mut stores = HashMap::new();
        for area in &config.storage.areas {
            let store = BatchFileStore::open(&config.storage.root_dir, area, config.batch.clone())?;
            stores.insert(area.clone(), Arc::new(store));
        }

        let cancel = CancellationToken::new();
        let retry = RetryRunner::new(config.retry.policy(), cancel.child_token());

        let migrator = ConsentMigrator::start(
            stores.values().cloned().collect(),
            retry.clone(),
            cancel.child_token(),
        );
        migrator.reconcile(config.initial_consent);
        consent.register_observer(migrator.clone());

        let mut workers = HashMap::new();
        for (area, uploader) in uploaders {
            let Some(store) = stores.get(&area) else {
                continue;
            };
            let worker = UploadWorker::new(
                Arc::clone(store),
                uploader,
                config.upload.worker.clone(),
                retry.clone(),
                cancel.child_token(),
            );
            worker.start(UploadScheduler::new(&config.upload.scheduler));
            workers.insert(area, worker);
        }

        info!(
            "Telemetry queue started at {:?} with {} areas ({} uploading), consent {}",
            config.storage.root_dir,
            stores.len(),
            workers.len(),
            config.initial_consent
        );

        Ok(Self {
            config,
            consent,
            stores,
            migrator,
            workers,
            cancel,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn consent(&self) -> &Arc<ConsentController> {
        &self.consent
    }

    pub fn set_consent(&self, state: ConsentState) {
        self.consent.set(state);
    }

    /// Persist an event for `area` under the current consent
    pub fn append(&self, area: &str, event: RawEvent) -> Result<WriteStatus> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        self.require_store(area)?.write_event(&self.consent, &event)
    }

    pub fn store(&self, area: &str) -> Option<&Arc<BatchFileStore>> {
        self.stores.get(area)
    }

    pub fn worker(&self, area: &str) -> Option<&UploadWorker> {
        self.workers.get(area)
    }

    /// Recorder that serializes domain events into `area`
    pub fn recorder<S: Serializer>(&self, area: &str, serializer: S) -> Result<EventRecorder<S>> {
        let store = self.require_store(area)?;
        Ok(EventRecorder::new(
            serializer,
            Arc::clone(store),
            Arc::clone(&self.consent),
        ))
    }

    /// Close every open batch so its events become uploadable
    pub fn flush(&self) {
        for store in self.stores.values() {
            store.close_open_batches();
        }
    }

    /// Wait for consent migrations queued so far
    pub async fn wait_for_migrations(&self) {
        self.migrator.wait_idle().await;
    }

    /// Run one upload cycle on every worker now, outside the timer
    pub async fn upload_now(&self) -> HashMap<String, CycleOutcome> {
        let mut outcomes = HashMap::new();
        for (area, worker) in &self.workers {
            outcomes.insert(area.clone(), worker.run_cycle().await);
        }
        outcomes
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            migration: self.migrator.stats(),
            uploads: self
                .workers
                .iter()
                .map(|(area, worker)| (area.clone(), worker.stats()))
                .collect(),
        }
    }

    /// Stop timers, let in-flight work finish, and close open batches
    ///
    /// Appends after this return [`QueueError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Telemetry queue shutting down");
        self.cancel.cancel();

        for worker in self.workers.values() {
            worker.shutdown().await;
        }
        self.migrator.shutdown().await;
        self.consent.clear_observers();
        self.flush();

        debug!("Telemetry queue stopped");
    }

    fn require_store(&self, area: &str) -> Result<&Arc<BatchFileStore>> {
        self.stores
            .get(area)
            .ok_or_else(|| QueueError::Config(format!("unknown area {:?}", area)))
    }
}

impl Drop for TelemetryQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
