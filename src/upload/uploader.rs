// src/upload/uploader.rs
//! Uploader contract
//!
//! Implementations perform the network call for one batch. They are invoked
//! from a blocking thread, one batch at a time per worker, and must tolerate
//! receiving the same batch twice (delivery is at-least-once).

use crate::utils::errors::{QueueError, Result};
use bytes::Bytes;
use std::fmt;

/// Result of uploading one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Accepted; the batch may be deleted
    Success,

    /// Worth trying again later (network down, 5xx, throttled)
    RetryableFailure(String),

    /// Will never be accepted (malformed payload, 4xx)
    PermanentFailure(String),
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadOutcome::Success => write!(f, "success"),
            UploadOutcome::RetryableFailure(reason) => write!(f, "retryable failure: {}", reason),
            UploadOutcome::PermanentFailure(reason) => write!(f, "permanent failure: {}", reason),
        }
    }
}

impl UploadOutcome {
    /// Map a failure onto the queue's error taxonomy
    pub fn into_result(self) -> Result<()> {
        match self {
            UploadOutcome::Success => Ok(()),
            UploadOutcome::RetryableFailure(reason) => Err(QueueError::UploadRetryable(reason)),
            UploadOutcome::PermanentFailure(reason) => Err(QueueError::UploadPermanent(reason)),
        }
    }
}

/// Sends a batch of serialized events somewhere
pub trait Uploader: Send + Sync + 'static {
    fn upload(&self, events: &[Bytes], metadata: Option<&[u8]>) -> UploadOutcome;
}

impl<F> Uploader for F
where
    F: Fn(&[Bytes], Option<&[u8]>) -> UploadOutcome + Send + Sync + 'static,
{
    fn upload(&self, events: &[Bytes], metadata: Option<&[u8]>) -> UploadOutcome {
        self(events, metadata)
    }
}
