// src/main.rs
//! Consent Queue demo
//!
//! Reads events from stdin, one per line, into every configured area. Lines
//! starting with `:` are commands:
//!
//! - `:grant`, `:deny`, `:pending` change consent
//! - `:flush` closes open batches so they can be uploaded
//! - `:stats` prints queue statistics
//!
//! Uploaded batches are written to `<root_dir>/outbox/<area>/`.

use anyhow::{Context, Result};
use bytes::Bytes;
use consent_queue::observability::init_tracing;
use consent_queue::{ConsentState, QueueConfig, RawEvent, TelemetryQueue, UploadOutcome, Uploader};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Writes each batch as a newline-separated file
struct DirectoryUploader {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl DirectoryUploader {
    fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).with_context(|| format!("creating outbox {:?}", dir))?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }
}

impl Uploader for DirectoryUploader {
    fn upload(&self, events: &[Bytes], metadata: Option<&[u8]>) -> UploadOutcome {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{:06}.txt", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"), seq);
        let path = self.dir.join(name);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&path)?;
            if let Some(meta) = metadata {
                file.write_all(b"# ")?;
                file.write_all(meta)?;
                file.write_all(b"\n")?;
            }
            for event in events {
                file.write_all(event)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()
        };

        match write() {
            Ok(()) => UploadOutcome::Success,
            Err(e) => UploadOutcome::RetryableFailure(format!("{:?}: {}", path, e)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting consent queue v{}", consent_queue::VERSION);

    let config_path = std::env::args().nth(1);
    let config = QueueConfig::load_from(config_path.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    let outbox = config.storage.root_dir.join("outbox");
    let mut uploaders: HashMap<String, Arc<dyn Uploader>> = HashMap::new();
    for area in &config.storage.areas {
        uploaders.insert(area.clone(), Arc::new(DirectoryUploader::new(outbox.join(area))?));
    }

    let areas = config.storage.areas.clone();
    let queue = TelemetryQueue::start(config, uploaders)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        };

        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "" => {}
            ":grant" => queue.set_consent(ConsentState::Granted),
            ":deny" => queue.set_consent(ConsentState::NotGranted),
            ":pending" => queue.set_consent(ConsentState::Pending),
            ":flush" => queue.flush(),
            ":stats" => println!("{:#?}", queue.stats()),
            cmd if cmd.starts_with(':') => warn!("Unknown command {}", cmd),
            event => {
                for area in &areas {
                    if let Err(e) = queue.append(area, RawEvent::new(event.to_string())) {
                        error!("Dropping event for {}: {}", area, e);
                    }
                }
            }
        }
    }

    queue.shutdown().await;
    info!("Consent queue stopped");
    Ok(())
}
