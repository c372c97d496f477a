// src/observability/mod.rs
//! Tracing setup and metric names
//!
//! The library only emits `tracing` events and `metrics` counters; installing
//! a subscriber or recorder is left to the host application. `init_tracing`
//! is a convenience for binaries.

use crate::utils::errors::{QueueError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Counter names
pub mod names {
    pub const EVENTS_WRITTEN: &str = "consent_queue_events_written_total";
    pub const EVENTS_DROPPED: &str = "consent_queue_events_dropped_total";
    pub const EVENTS_SERIALIZATION_DROPPED: &str = "consent_queue_events_serialization_dropped_total";
    pub const BATCHES_UPLOADED: &str = "consent_queue_batches_uploaded_total";
    pub const BATCHES_REJECTED: &str = "consent_queue_batches_rejected_total";
    pub const BATCHES_CORRUPT: &str = "consent_queue_batches_corrupt_total";
    pub const BATCHES_EVICTED: &str = "consent_queue_batches_evicted_total";
    pub const UPLOAD_FAILURES: &str = "consent_queue_upload_failures_total";
    pub const MIGRATION_PASSES: &str = "consent_queue_migration_passes_total";
    pub const MIGRATION_FAILURES: &str = "consent_queue_migration_failures_total";
}

/// Install a JSON `tracing` subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .try_init()
        .map_err(|e| QueueError::Config(format!("tracing already initialized: {}", e)))
}
