// src/recording/batch_writer.rs
//! Append-only writer for a single open batch file
//!
//! Each frame is written with one `write_all` and synced before returning,
//! so an acknowledged append survives process death. A failed write is
//! rolled back by truncating to the last good frame.

use crate::recording::framing::encode_frame;
use crate::utils::errors::{QueueError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writer for the currently open batch
pub struct BatchWriter {
    file: File,
    path: PathBuf,
    position: u64,
    event_count: u64,
}

impl BatchWriter {
    /// Create a new, empty batch file (fails if it already exists)
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| QueueError::io(&path, e))?;

        debug!("Opened batch file {:?}", path);

        Ok(Self {
            file,
            path,
            position: 0,
            event_count: 0,
        })
    }

    /// Append one framed payload; returns bytes written
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let frame = encode_frame(payload);

        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());

        if let Err(e) = written {
            self.rollback();
            return Err(QueueError::io(&self.path, e));
        }

        self.position += frame.len() as u64;
        self.event_count += 1;
        Ok(frame.len())
    }

    /// Flush changes to disk
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| QueueError::io(&self.path, e))
    }

    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.position) {
            // The reader drops the torn frame at EOF; the caller closes this batch.
            warn!("Could not truncate {:?} after failed write: {}", self.path, e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Replace a batch's metadata sibling atomically (write temp, then rename)
pub fn write_metadata(path: &Path, metadata: &[u8]) -> Result<()> {
    let tmp = path.with_extension("meta.tmp");

    let result = File::create(&tmp)
        .and_then(|mut f| {
            f.write_all(metadata)?;
            f.sync_data()
        })
        .and_then(|_| fs::rename(&tmp, path));

    result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        QueueError::io(path, e)
    })
}
