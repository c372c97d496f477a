// src/utils/errors.rs
//! Error taxonomy for the queue
//!
//! Every failure is classified as retryable or not. `RetryRunner` and the
//! upload worker consult [`Retryable`] to decide whether another attempt makes
//! sense; nothing outside the append path ever surfaces these to a caller.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Queue error type
#[derive(Error, Debug)]
pub enum QueueError {
    /// I/O failure expected to clear up (file busy, disk momentarily full)
    #[error("transient I/O error on {path:?}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure that will not succeed on retry (permissions, bad path)
    #[error("permanent I/O error on {path:?}: {source}")]
    PermanentIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Batch file cannot be decoded
    #[error("corrupt batch {path:?}: {reason}")]
    CorruptData { path: PathBuf, reason: String },

    /// Uploader reported a failure worth retrying later
    #[error("upload failed, will retry: {0}")]
    UploadRetryable(String),

    /// Uploader rejected the payload for good
    #[error("upload rejected: {0}")]
    UploadPermanent(String),

    /// Event is larger than a single batch item may be
    #[error("event of {size} bytes exceeds the {max} byte item limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),

    /// Operation attempted after shutdown
    #[error("queue is shut down")]
    ShutDown,
}

/// Error surfaced by the append path
pub type WriteError = QueueError;

/// Result type alias
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that know whether retrying them can help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl QueueError {
    /// Classify an `io::Error` raised while touching `path`
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::NotFound
            | io::ErrorKind::Unsupported => QueueError::PermanentIo { path, source },
            _ => QueueError::TransientIo { path, source },
        }
    }

    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        QueueError::CorruptData {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::TransientIo { .. } | QueueError::UploadRetryable(_)
        )
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for QueueError {
    fn from(err: tokio::task::JoinError) -> Self {
        QueueError::Task(err.to_string())
    }
}
