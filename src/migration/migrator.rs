// src/migration/migrator.rs
//! Consent-driven data migration
//!
//! Observes consent transitions and moves or wipes the pending area of every
//! registered store. Passes run one at a time on a background task, in the
//! order the transitions happened, each under the shared retry policy.
//!
//! A pass only touches batches that existed when its transition happened:
//! the transition seals the pending area of each store and the pass carries
//! the resulting watermark. Data written during a later `Pending` period
//! waits for the transition that ends that period.

use crate::consent::{ConsentObserver, ConsentState};
use crate::observability::names;
use crate::recording::storage::{BatchFileStore, RetentionArea};
use crate::runtime::retry::RetryRunner;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a transition does to stored data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Move everything in `pending/` to `approved/`
    MoveToApproved,

    /// Delete everything in `pending/`
    WipePending,

    /// Leave data where it is
    NoOp,
}

impl Migration {
    /// Resolve the migration for a `(previous, current)` transition
    pub fn for_transition(previous: ConsentState, current: ConsentState) -> Self {
        match (previous, current) {
            (ConsentState::Pending, ConsentState::Granted) => Migration::MoveToApproved,
            (ConsentState::Pending, ConsentState::NotGranted) => Migration::WipePending,
            // Granted -> NotGranted keeps approved data; nothing re-enters
            // Pending with data, and nothing is retained while NotGranted.
            _ => Migration::NoOp,
        }
    }

    /// Apply to the batches of one store up to `watermark`; returns the
    /// number of batches handled
    pub fn apply(&self, store: &BatchFileStore, watermark: u64) -> Result<usize> {
        match self {
            Migration::MoveToApproved => store
                .move_through(RetentionArea::Pending, RetentionArea::Approved, watermark)
                .into_result(),
            Migration::WipePending => store
                .wipe_through(RetentionArea::Pending, watermark)
                .into_result(),
            Migration::NoOp => Ok(0),
        }
    }
}

enum Job {
    Transition {
        previous: ConsentState,
        current: ConsentState,
        migration: Migration,
        /// One per store, in store order
        watermarks: Vec<u64>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Migration statistics
#[derive(Debug, Clone, Default)]
pub struct MigrationStats {
    pub passes: u64,
    pub failures: u64,
    pub batches_moved: u64,
    pub batches_wiped: u64,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    failures: AtomicU64,
    batches_moved: AtomicU64,
    batches_wiped: AtomicU64,
}

/// Background migrator; register it as a consent observer
pub struct ConsentMigrator {
    stores: Vec<Arc<BatchFileStore>>,
    jobs: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ConsentMigrator {
    /// Spawn the migration task on the current tokio runtime
    pub fn start(stores: Vec<Arc<BatchFileStore>>, retry: RetryRunner, cancel: CancellationToken) -> Arc<Self> {
        let (jobs, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(run(
            stores.clone(),
            rx,
            retry,
            cancel.clone(),
            Arc::clone(&counters),
        ));

        info!("Consent migrator started for {} stores", stores.len());

        Arc::new(Self {
            stores,
            jobs,
            cancel,
            handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Queue a migration pass for a transition
    pub fn submit(&self, previous: ConsentState, current: ConsentState) {
        let migration = Migration::for_transition(previous, current);
        if migration == Migration::NoOp {
            debug!("No migration for {} -> {}", previous, current);
            return;
        }

        // Writes that already picked an area under `previous` finish first.
        let watermarks = self
            .stores
            .iter()
            .map(|store| store.seal(RetentionArea::Pending))
            .collect();

        let job = Job::Transition {
            previous,
            current,
            migration,
            watermarks,
        };
        if self.jobs.send(job).is_err() {
            warn!("Migrator stopped; ignoring {} -> {}", previous, current);
        }
    }

    /// Settle data a previous process left in `pending/`
    ///
    /// Treated as the `Pending -> initial` transition.
    pub fn reconcile(&self, initial: ConsentState) {
        self.submit(ConsentState::Pending, initial);
    }

    /// Resolves once every pass queued before this call has finished
    pub async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> MigrationStats {
        MigrationStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            batches_moved: self.counters.batches_moved.load(Ordering::Relaxed),
            batches_wiped: self.counters.batches_wiped.load(Ordering::Relaxed),
        }
    }

    /// Finish queued passes (retry delays cut short), then stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Migration task ended abnormally: {}", e);
            }
        }
    }
}

impl ConsentObserver for ConsentMigrator {
    fn on_consent_changed(&self, previous: ConsentState, current: ConsentState) {
        self.submit(previous, current);
    }
}

async fn run(
    stores: Vec<Arc<BatchFileStore>>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    retry: RetryRunner,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let job = tokio::select! {
            biased;
            job = rx.recv() => job,
            _ = cancel.cancelled() => None,
        };

        let (previous, current, migration, watermarks) = match job {
            None => break,
            Some(Job::Barrier(done)) => {
                let _ = done.send(());
                continue;
            }
            Some(Job::Transition {
                previous,
                current,
                migration,
                watermarks,
            }) => (previous, current, migration, watermarks),
        };

        counters.passes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::MIGRATION_PASSES).increment(1);

        for (store, watermark) in stores.iter().zip(watermarks) {
            let result = retry
                .retry("consent migration", || {
                    let store = Arc::clone(store);
                    async move {
                        tokio::task::spawn_blocking(move || migration.apply(&store, watermark)).await?
                    }
                })
                .await;

            match result {
                Ok(count) => {
                    let counter = match migration {
                        Migration::WipePending => &counters.batches_wiped,
                        _ => &counters.batches_moved,
                    };
                    counter.fetch_add(count as u64, Ordering::Relaxed);
                    debug!(
                        "{:?} on {:?} handled {} batches",
                        migration,
                        store.area_id(),
                        count
                    );
                }
                Err(err) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(names::MIGRATION_FAILURES).increment(1);
                    error!(
                        "{:?} on {:?} gave up for {} -> {}: {}",
                        migration,
                        store.area_id(),
                        previous,
                        current,
                        err
                    );
                }
            }
        }
    }

    debug!("Consent migrator stopped");
}
