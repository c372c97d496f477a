// src/lib.rs
//! Consent Queue Library
//!
//! A durable, consent-governed local event queue. Events are written to
//! append-only batch files, held back while the user has not decided on data
//! collection, and uploaded in the background once consent is granted.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **consent**: Consent state and the observer-notifying controller
//! - **recording**: Serializers, batch framing and the batch file store
//! - **migration**: Moving or wiping held-back data on consent transitions
//! - **runtime**: Retry execution shared by background tasks
//! - **upload**: Adaptive scheduling and the upload worker
//! - **queue**: Facade wiring everything together
//! - **observability**: Tracing setup and metric names
//! - **utils**: Configuration and error types

// Public module exports
pub mod consent;
pub mod migration;
pub mod observability;
pub mod queue;
pub mod recording;
pub mod runtime;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use consent::{ConsentController, ConsentObserver, ConsentState};
pub use queue::{QueueStats, TelemetryQueue};
pub use recording::{BatchFileStore, EventRecorder, JsonSerializer, RawEvent, RetentionArea, Serializer, WriteStatus};
pub use upload::{UploadFrequency, UploadOutcome, Uploader};
pub use utils::config::QueueConfig;
pub use utils::errors::{QueueError, Result, WriteError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
