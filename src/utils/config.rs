// src/utils/config.rs
//! Queue configuration
//!
//! Loaded from an optional file (any format the `config` crate understands)
//! layered under environment variables such as
//! `CONSENT_QUEUE__BATCH__MAX_BATCH_COUNT=100`.

use crate::consent::ConsentState;
use crate::recording::storage::BatchConfig;
use crate::runtime::retry::RetryPolicy;
use crate::upload::scheduler::SchedulerConfig;
use crate::upload::worker::WorkerConfig;
use crate::utils::errors::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "CONSENT_QUEUE";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Consent in effect until the first explicit change
    pub initial_consent: ConsentState,

    /// Where batches live and which areas exist
    pub storage: StorageSettings,

    /// Batch rollover and retention limits
    pub batch: BatchConfig,

    /// Upload cadence
    pub upload: UploadSettings,

    /// Retry policy shared by migration and upload
    pub retry: RetrySettings,
}

/// Storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory holding `pending/` and `approved/`
    pub root_dir: PathBuf,

    /// Area ids (one per telemetry stream, e.g. `logs`, `rum`)
    pub areas: Vec<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("consent-queue"),
            areas: vec!["logs".to_string()],
        }
    }
}

/// Upload scheduling knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,

    #[serde(flatten)]
    pub worker: WorkerConfig,
}

/// Retry knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, first one included
    pub max_retries: u32,

    /// Pause between attempts (milliseconds)
    pub retry_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_consent: ConsentState::Pending,
            storage: StorageSettings::default(),
            batch: BatchConfig::default(),
            upload: UploadSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl QueueConfig {
    /// Load from environment only
    pub fn load() -> Result<Self> {
        Self::load_from(None::<&Path>)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load_from<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration file {:?}", path.as_ref());
            builder = builder.add_source(config::File::from(path.as_ref()).required(true));
        }

        let config: QueueConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.areas")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.areas.is_empty() {
            return Err(QueueError::Config("at least one area is required".to_string()));
        }
        for (i, area) in self.storage.areas.iter().enumerate() {
            if area.is_empty() || area.contains(['/', '\\']) || area.starts_with('.') {
                return Err(QueueError::Config(format!("invalid area id {:?}", area)));
            }
            if self.storage.areas[..i].contains(area) {
                return Err(QueueError::Config(format!("duplicate area id {:?}", area)));
            }
        }
        if self.retry.max_retries == 0 {
            return Err(QueueError::Config("max_retries must be at least 1".to_string()));
        }

        self.batch.validate().map_err(QueueError::Config)?;
        self.upload.scheduler.validate().map_err(QueueError::Config)?;
        self.upload.worker.validate().map_err(QueueError::Config)?;

        Ok(())
    }
}
