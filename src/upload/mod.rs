// src/upload/mod.rs
//! Uploading approved batches
//!
//! - **Scheduler**: adaptive delay between cycles
//! - **Uploader**: the network collaborator contract
//! - **Worker**: timer loop that leases, uploads and deletes batches
//!
//! # Architecture
//!
//! ```text
//!        ┌────────────── UploadScheduler ◄──────────────┐
//!        │ delay                                  outcome│
//!        ▼                                              │
//!   sleep ──► lease oldest ──► read ──► Uploader ──► Success ──► delete
//!                ▲                          │
//!                │                          ├─► Retryable ──► release, back off
//!                └──── next batch ◄─────────┴─► Permanent ──► delete, log
//! ```

pub mod scheduler;
pub mod uploader;
pub mod worker;

// Re-export commonly used types
pub use scheduler::{CycleOutcome, SchedulerConfig, UploadFrequency, UploadScheduler};
pub use uploader::{UploadOutcome, Uploader};
pub use worker::{UploadStats, UploadWorker, WorkerConfig, WorkerState};
