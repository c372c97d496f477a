// src/recording/mod.rs
//! Event recording and batch storage
//!
//! - **Recorder**: serializes events and routes them by consent
//! - **Storage**: batch files per retention area, rollover, retention
//! - **Batch Writer**: append-only, synced writes to the open batch
//! - **Framing**: `[u32 length][payload]` frames
//!
//! # Architecture
//!
//! ```text
//! Producer → record() → Serializer → write_event()
//!                                        │ consent?
//!                 ┌──────────────────────┼──────────────────────┐
//!              Pending                Granted               NotGranted
//!                 ↓                      ↓                      ↓
//!        pending/<area>/batch-N   approved/<area>/batch-N     dropped
//!                 │                      ↑
//!                 └──── migration ───────┘
//! ```

pub mod batch_writer;
pub mod framing;
pub mod recorder;
pub mod storage;

// Re-export commonly used types
pub use batch_writer::BatchWriter;
pub use recorder::{EventRecorder, JsonSerializer, RecordOutcome, RecorderStats, Serializer};
pub use storage::{
    BatchConfig, BatchContents, BatchFileStore, BatchRef, RawEvent, RetentionArea, StorageStats,
    TransferReport, WriteStatus,
};
