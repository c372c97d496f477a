// src/recording/storage.rs
//! Batch file store
//!
//! Owns the on-disk layout of one area id across both retention areas:
//!
//! ```text
//! <root>/pending/<area-id>/batch-<id>.bin   (+ batch-<id>.meta)
//! <root>/approved/<area-id>/batch-<id>.bin
//! ```
//!
//! Ids are creation timestamps in milliseconds, bumped when needed so they
//! stay strictly increasing; ordering batches by id is ordering by age. At
//! most one batch per retention area is open for writes. Every other batch
//! file is closed and never written again.

use crate::consent::{ConsentController, ConsentState};
use crate::observability::names;
use crate::recording::batch_writer::{write_metadata, BatchWriter};
use crate::recording::framing::{decode_frames, frame_len};
use crate::utils::errors::{QueueError, Result};
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BATCH_PREFIX: &str = "batch-";
const BATCH_EXTENSION: &str = "bin";
const METADATA_EXTENSION: &str = "meta";

/// Directory a batch lives in, according to the consent it was written under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionArea {
    /// Written while consent was pending
    Pending,

    /// Eligible for upload
    Approved,
}

impl RetentionArea {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RetentionArea::Pending => "pending",
            RetentionArea::Approved => "approved",
        }
    }
}

impl fmt::Display for RetentionArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Opaque serialized event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Event payload
    pub data: Bytes,

    /// Batch-level metadata; the latest value written to a batch wins
    pub metadata: Option<Bytes>,
}

impl RawEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Where a write ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written(RetentionArea),

    /// Consent is `NotGranted`; nothing was persisted
    Dropped,
}

/// Reference to a batch file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchRef {
    area: RetentionArea,
    id: u64,
    path: PathBuf,
}

impl BatchRef {
    pub fn area(&self) -> RetentionArea {
        self.area
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.with_extension(METADATA_EXTENSION)
    }

    fn file_name(&self) -> String {
        batch_file_name(self.id)
    }
}

/// Events and metadata decoded from a closed batch
#[derive(Debug, Clone, Default)]
pub struct BatchContents {
    pub events: Vec<Bytes>,
    pub metadata: Option<Bytes>,
}

impl BatchContents {
    pub fn payload_size(&self) -> usize {
        self.events.iter().map(|e| e.len()).sum()
    }
}

/// Rollover and retention limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Close a batch once its file reaches this many bytes
    pub max_batch_size: u64,

    /// Close a batch once it holds this many events
    pub max_batch_count: u64,

    /// Close a batch once it has been open this long (milliseconds)
    pub max_batch_age_ms: u64,

    /// Largest single event accepted, measured as its on-disk frame
    pub max_item_size: usize,

    /// Per retention area disk quota; oldest batches are evicted above it
    pub max_disk_space: u64,

    /// Batches older than this are deleted (milliseconds)
    pub old_file_threshold_ms: u64,

    /// Minimum spacing of cleanup passes on the write path (milliseconds)
    pub cleanup_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4 * 1024 * 1024,
            max_batch_count: 500,
            max_batch_age_ms: 5_000,
            max_item_size: 512 * 1024,
            max_disk_space: 128 * 1024 * 1024,
            old_file_threshold_ms: 18 * 60 * 60 * 1000,
            cleanup_interval_ms: 1_000,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size cannot be 0".to_string());
        }
        if self.max_batch_count == 0 {
            return Err("max_batch_count cannot be 0".to_string());
        }
        if self.max_item_size == 0 {
            return Err("max_item_size cannot be 0".to_string());
        }
        if self.max_item_size as u64 > self.max_batch_size {
            return Err("max_item_size cannot exceed max_batch_size".to_string());
        }
        if self.max_disk_space < self.max_batch_size {
            return Err("max_disk_space cannot be smaller than max_batch_size".to_string());
        }
        Ok(())
    }

    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Storage statistics for one retention area
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_batches: u64,
    pub total_size_bytes: u64,
}

/// Outcome of a bulk move or wipe
#[derive(Debug, Default)]
pub struct TransferReport {
    /// Batches moved or deleted
    pub transferred: usize,

    /// Last failure, if any batch could not be handled
    pub last_error: Option<QueueError>,
}

impl TransferReport {
    pub fn into_result(self) -> Result<usize> {
        match self.last_error {
            Some(err) => Err(err),
            None => Ok(self.transferred),
        }
    }
}

struct OpenBatch {
    id: u64,
    writer: BatchWriter,
    opened_at: Instant,
}

struct AreaState {
    area: RetentionArea,
    dir: PathBuf,
    open: Option<OpenBatch>,
    last_cleanup: Option<Instant>,
}

impl AreaState {
    fn open_id(&self) -> Option<u64> {
        self.open.as_ref().map(|b| b.id)
    }
}

/// Batch files for one area id
pub struct BatchFileStore {
    area_id: String,
    config: BatchConfig,
    pending: Mutex<AreaState>,
    approved: Mutex<AreaState>,

    /// Last id handed out; shared so moved batches never collide
    last_id: AtomicU64,

    /// Held shared while a write decides its area; taken exclusively to fence
    routing: RwLock<()>,

    /// Batches currently handed to an uploader
    leased: DashSet<PathBuf>,
}

impl BatchFileStore {
    /// Open (creating if needed) the store for `area_id` under `root`
    pub fn open<P: AsRef<Path>>(root: P, area_id: &str, config: BatchConfig) -> Result<Self> {
        let root = root.as_ref();
        let mut last_id = 0;

        let pending = open_area(root, RetentionArea::Pending, area_id, &mut last_id)?;
        let approved = open_area(root, RetentionArea::Approved, area_id, &mut last_id)?;

        info!("Batch store {:?} opened at {:?}", area_id, root);

        Ok(Self {
            area_id: area_id.to_string(),
            config,
            pending: Mutex::new(pending),
            approved: Mutex::new(approved),
            last_id: AtomicU64::new(last_id),
            routing: RwLock::new(()),
            leased: DashSet::new(),
        })
    }

    pub fn area_id(&self) -> &str {
        &self.area_id
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Directory backing `area`
    pub fn dir(&self, area: RetentionArea) -> PathBuf {
        self.state(area).lock().dir.clone()
    }

    /// Route an event according to current consent and append it
    pub fn write_event(&self, consent: &ConsentController, event: &RawEvent) -> Result<WriteStatus> {
        let _route = self.routing.read();

        let area = match consent.get() {
            ConsentState::NotGranted => {
                metrics::counter!(names::EVENTS_DROPPED).increment(1);
                return Ok(WriteStatus::Dropped);
            }
            ConsentState::Pending => RetentionArea::Pending,
            ConsentState::Granted => RetentionArea::Approved,
        };

        self.append(area, event)?;
        Ok(WriteStatus::Written(area))
    }

    /// Close the open batch of `area` once in-flight writes have finished
    ///
    /// Returns a watermark: every batch of `area` that holds a write routed
    /// before this call has an id at or below it, and every batch created
    /// afterwards has a larger one.
    pub fn seal(&self, area: RetentionArea) -> u64 {
        let _route = self.routing.write();
        let mut state = self.state(area).lock();
        if let Some(open) = state.open.take() {
            debug!("Sealed batch {} in {}", open.id, area);
        }
        self.last_id.load(Ordering::Acquire)
    }

    /// Append one event to the open batch of `area`, rolling over as needed
    pub fn append(&self, area: RetentionArea, event: &RawEvent) -> Result<()> {
        let incoming = frame_len(event.data.len());
        if incoming > self.config.max_item_size {
            return Err(QueueError::PayloadTooLarge {
                size: incoming,
                max: self.config.max_item_size,
            });
        }

        let mut state = self.state(area).lock();
        self.maybe_cleanup(&mut state);

        let mut open = match state.open.take() {
            Some(open) => match self.rollover_reason(&open, incoming) {
                None => open,
                Some(reason) => {
                    debug!("Closing batch {} in {}: {}", open.id, area, reason);
                    drop(open);
                    self.new_batch(&state.dir)?
                }
            },
            None => self.new_batch(&state.dir)?,
        };

        // Metadata first: nothing may fail once the frame is synced.
        if let Some(metadata) = &event.metadata {
            let metadata_path = open.writer.path().with_extension(METADATA_EXTENSION);
            if let Err(err) = write_metadata(&metadata_path, metadata) {
                warn!("Metadata write for batch {} in {} failed: {}", open.id, area, err);
                state.open = Some(open);
                return Err(err);
            }
        }

        // On failure the batch is dropped here, i.e. closed for good.
        if let Err(err) = open.writer.write_frame(&event.data) {
            warn!("Write to batch {} in {} failed: {}", open.id, area, err);
            return Err(err);
        }

        state.open = Some(open);
        metrics::counter!(names::EVENTS_WRITTEN).increment(1);
        Ok(())
    }

    fn new_batch(&self, dir: &Path) -> Result<OpenBatch> {
        let id = self.next_id();
        let writer = BatchWriter::create(dir.join(batch_file_name(id)))?;
        Ok(OpenBatch {
            id,
            writer,
            opened_at: Instant::now(),
        })
    }

    fn rollover_reason(&self, open: &OpenBatch, incoming: usize) -> Option<&'static str> {
        if open.writer.event_count() >= self.config.max_batch_count {
            Some("event count")
        } else if open.writer.position() + incoming as u64 > self.config.max_batch_size {
            Some("size")
        } else if open.opened_at.elapsed() >= self.config.max_batch_age() {
            Some("age")
        } else {
            None
        }
    }

    /// Closed batches of `area`, oldest first
    pub fn list_closed_batches(&self, area: RetentionArea) -> Result<Vec<BatchRef>> {
        let mut state = self.state(area).lock();
        self.close_if_expired(&mut state);
        list_closed_locked(&state)
    }

    /// Decode a closed batch; a torn trailing frame is dropped
    pub fn read_batch(&self, batch: &BatchRef) -> Result<BatchContents> {
        let data = fs::read(batch.path()).map_err(|e| QueueError::io(batch.path(), e))?;
        let total = data.len();

        let decoded = decode_frames(Bytes::from(data));

        if decoded.is_unreadable() {
            return Err(QueueError::corrupt(batch.path(), "no decodable frame"));
        }
        if decoded.discarded_bytes > 0 {
            warn!(
                "Batch {} dropped {} of {} trailing bytes",
                batch.id(),
                decoded.discarded_bytes,
                total
            );
        }

        let metadata = match fs::read(batch.metadata_path()) {
            Ok(meta) => Some(Bytes::from(meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(QueueError::io(batch.metadata_path(), e)),
        };

        Ok(BatchContents {
            events: decoded.events,
            metadata,
        })
    }

    /// Remove a batch and its metadata; missing files are not an error
    pub fn delete_batch(&self, batch: &BatchRef) -> Result<()> {
        remove_if_exists(batch.path())?;
        remove_if_exists(&batch.metadata_path())?;
        self.leased.remove(batch.path());
        debug!("Deleted batch {} from {}", batch.id(), batch.area());
        Ok(())
    }

    /// Move one batch to another retention area
    ///
    /// Returns `None` when the source is already gone.
    pub fn move_batch(&self, batch: &BatchRef, to: RetentionArea) -> Result<Option<BatchRef>> {
        if batch.area() == to {
            return Ok(Some(batch.clone()));
        }

        let (mut pending, mut approved) = self.lock_both();
        let (from_state, to_state) = match to {
            RetentionArea::Approved => (&mut *pending, &*approved),
            RetentionArea::Pending => (&mut *approved, &*pending),
        };

        if from_state.open_id() == Some(batch.id()) {
            from_state.open = None;
        }

        move_locked(batch, to_state)
    }

    /// Move every batch of `from` into `to`, including the open one
    pub fn move_all(&self, from: RetentionArea, to: RetentionArea) -> TransferReport {
        self.move_through(from, to, u64::MAX)
    }

    /// Move the batches of `from` with an id at or below `watermark`
    ///
    /// Both areas stay locked for the whole pass, so readers never observe a
    /// batch mid-move. Safe to re-run after a partial failure.
    pub fn move_through(&self, from: RetentionArea, to: RetentionArea, watermark: u64) -> TransferReport {
        let mut report = TransferReport::default();
        if from == to {
            return report;
        }

        let (mut pending, mut approved) = self.lock_both();
        let (from_state, to_state) = match to {
            RetentionArea::Approved => (&mut *pending, &*approved),
            RetentionArea::Pending => (&mut *approved, &*pending),
        };
        close_through(from_state, watermark);

        let batches = match scan_through(from, &from_state.dir, watermark) {
            Ok(batches) => batches,
            Err(err) => {
                report.last_error = Some(err);
                return report;
            }
        };

        for batch in batches {
            match move_locked(&batch, to_state) {
                Ok(Some(_)) => report.transferred += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!("Could not move batch {} to {}: {}", batch.id(), to, err);
                    report.last_error = Some(err);
                }
            }
        }

        info!(
            "Moved {} batches of {:?} from {} to {}",
            report.transferred, self.area_id, from, to
        );
        report
    }

    /// Delete every batch of `area`, including the open one
    pub fn wipe(&self, area: RetentionArea) -> TransferReport {
        self.wipe_through(area, u64::MAX)
    }

    /// Delete the batches of `area` with an id at or below `watermark`
    pub fn wipe_through(&self, area: RetentionArea, watermark: u64) -> TransferReport {
        let mut report = TransferReport::default();
        let mut state = self.state(area).lock();
        close_through(&mut state, watermark);

        let batches = match scan_through(area, &state.dir, watermark) {
            Ok(batches) => batches,
            Err(err) => {
                report.last_error = Some(err);
                return report;
            }
        };

        for batch in batches {
            match self.delete_batch(&batch) {
                Ok(()) => report.transferred += 1,
                Err(err) => {
                    warn!("Could not delete batch {} in {}: {}", batch.id(), area, err);
                    report.last_error = Some(err);
                }
            }
        }

        info!(
            "Wiped {} batches of {:?} from {}",
            report.transferred, self.area_id, area
        );
        report
    }

    /// Oldest closed batch of `area` not already handed out; marks it leased
    pub fn lease_oldest(&self, area: RetentionArea) -> Result<Option<BatchRef>> {
        let batches = self.list_closed_batches(area)?;
        Ok(batches
            .into_iter()
            .find(|batch| self.leased.insert(batch.path().to_path_buf())))
    }

    /// Give a leased batch back without deleting it
    pub fn release(&self, batch: &BatchRef) {
        self.leased.remove(batch.path());
    }

    pub fn is_leased(&self, batch: &BatchRef) -> bool {
        self.leased.contains(batch.path())
    }

    /// Close every open batch so it becomes readable
    pub fn close_open_batches(&self) {
        for area in [RetentionArea::Pending, RetentionArea::Approved] {
            let mut state = self.state(area).lock();
            if let Some(open) = state.open.take() {
                debug!("Closed batch {} in {} on flush", open.id, area);
            }
        }
    }

    /// Run obsolete-file deletion and quota eviction on both areas now
    pub fn enforce_retention(&self) {
        for area in [RetentionArea::Pending, RetentionArea::Approved] {
            let mut state = self.state(area).lock();
            self.cleanup_locked(&mut state);
        }
    }

    /// Count and size of the batches in `area`, open batch included
    pub fn stats(&self, area: RetentionArea) -> Result<StorageStats> {
        let state = self.state(area).lock();
        let mut stats = StorageStats::default();

        for batch in scan_dir(area, &state.dir)? {
            stats.total_batches += 1;
            stats.total_size_bytes += batch_disk_size(&batch);
        }

        Ok(stats)
    }

    fn state(&self, area: RetentionArea) -> &Mutex<AreaState> {
        match area {
            RetentionArea::Pending => &self.pending,
            RetentionArea::Approved => &self.approved,
        }
    }

    /// Lock order is always pending, then approved
    fn lock_both(&self) -> (MutexGuard<'_, AreaState>, MutexGuard<'_, AreaState>) {
        let pending = self.pending.lock();
        let approved = self.approved.lock();
        (pending, approved)
    }

    fn next_id(&self) -> u64 {
        let now = now_millis();
        let previous = self
            .last_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn close_if_expired(&self, state: &mut AreaState) {
        let expired = state
            .open
            .as_ref()
            .map_or(false, |open| open.opened_at.elapsed() >= self.config.max_batch_age());

        if expired {
            if let Some(open) = state.open.take() {
                debug!("Closed idle batch {} in {}", open.id, state.area);
            }
        }
    }

    fn maybe_cleanup(&self, state: &mut AreaState) {
        let due = state
            .last_cleanup
            .map_or(true, |at| at.elapsed() >= self.config.cleanup_interval());
        if due {
            self.cleanup_locked(state);
        }
    }

    fn cleanup_locked(&self, state: &mut AreaState) {
        state.last_cleanup = Some(Instant::now());

        let batches = match list_closed_locked(state) {
            Ok(batches) => batches,
            Err(err) => {
                warn!("Cleanup of {} skipped: {}", state.area, err);
                return;
            }
        };

        let threshold = now_millis().saturating_sub(self.config.old_file_threshold_ms);
        let mut remaining = Vec::with_capacity(batches.len());

        for batch in batches {
            if batch.id() < threshold && !self.is_leased(&batch) {
                debug!("Deleting obsolete batch {} in {}", batch.id(), state.area);
                if let Err(err) = self.delete_batch(&batch) {
                    warn!("Could not delete obsolete batch {}: {}", batch.id(), err);
                }
            } else {
                remaining.push(batch);
            }
        }

        let open_size = state.open.as_ref().map_or(0, |o| o.writer.position());
        let mut size_on_disk: u64 =
            open_size + remaining.iter().map(batch_disk_size).sum::<u64>();

        if size_on_disk <= self.config.max_disk_space {
            return;
        }

        warn!(
            "Too much disk space used in {} ({}/{} bytes); evicting oldest batches",
            state.area, size_on_disk, self.config.max_disk_space
        );

        for batch in remaining {
            if size_on_disk <= self.config.max_disk_space {
                break;
            }
            if self.is_leased(&batch) {
                continue;
            }
            let size = batch_disk_size(&batch);
            match self.delete_batch(&batch) {
                Ok(()) => {
                    size_on_disk = size_on_disk.saturating_sub(size);
                    metrics::counter!(names::BATCHES_EVICTED).increment(1);
                }
                Err(err) => warn!("Could not evict batch {}: {}", batch.id(), err),
            }
        }
    }
}

fn open_area(
    root: &Path,
    area: RetentionArea,
    area_id: &str,
    last_id: &mut u64,
) -> Result<AreaState> {
    let dir = root.join(area.dir_name()).join(area_id);
    fs::create_dir_all(&dir).map_err(|e| QueueError::io(&dir, e))?;

    for batch in scan_dir(area, &dir)? {
        *last_id = (*last_id).max(batch.id);
    }

    Ok(AreaState {
        area,
        dir,
        open: None,
        last_cleanup: None,
    })
}

fn close_through(state: &mut AreaState, watermark: u64) {
    if state.open_id().map_or(false, |id| id <= watermark) {
        state.open = None;
    }
}

fn scan_through(area: RetentionArea, dir: &Path, watermark: u64) -> Result<Vec<BatchRef>> {
    let mut batches = scan_dir(area, dir)?;
    batches.retain(|b| b.id() <= watermark);
    Ok(batches)
}

fn list_closed_locked(state: &AreaState) -> Result<Vec<BatchRef>> {
    let open_id = state.open_id();
    let mut batches = scan_dir(state.area, &state.dir)?;
    batches.retain(|b| Some(b.id()) != open_id);
    Ok(batches)
}

/// Move without taking locks; the caller holds both area locks
fn move_locked(batch: &BatchRef, to: &AreaState) -> Result<Option<BatchRef>> {
    let target = BatchRef {
        area: to.area,
        id: batch.id(),
        path: to.dir.join(batch.file_name()),
    };

    if !exists(batch.path())? {
        // Already moved by an earlier, partially failed pass.
        remove_if_exists(&batch.metadata_path())?;
        return Ok(None);
    }

    if exists(&batch.metadata_path())? {
        relocate(&batch.metadata_path(), &target.metadata_path())?;
    }
    relocate(batch.path(), target.path())?;

    debug!("Moved batch {} to {}", batch.id(), to.area);
    Ok(Some(target))
}

/// Rename, or copy + verify + delete when rename is not possible
fn relocate(from: &Path, to: &Path) -> Result<()> {
    relocate_with(from, to, |from, to| fs::rename(from, to), |path| fs::remove_file(path))
}

fn relocate_with<R, D>(from: &Path, to: &Path, rename: R, remove_source: D) -> Result<()>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
    D: Fn(&Path) -> io::Result<()>,
{
    let rename_err = match rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound && !exists(from)? => return Ok(()),
        Err(e) => e,
    };

    debug!("Rename {:?} failed ({}); copying instead", from, rename_err);

    let tmp = to.with_extension("tmp");
    let copied = fs::copy(from, &tmp).map_err(|e| QueueError::io(from, e))?;
    let expected = fs::metadata(from).map_err(|e| QueueError::io(from, e))?.len();

    if copied != expected {
        let _ = fs::remove_file(&tmp);
        return Err(QueueError::TransientIo {
            path: to.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::Other,
                format!("copied {} of {} bytes", copied, expected),
            ),
        });
    }

    if let Err(e) = fs::rename(&tmp, to) {
        let _ = fs::remove_file(&tmp);
        return Err(QueueError::io(to, e));
    }

    match remove_source(from) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            // The source stays authoritative; a file must never sit in both areas.
            if let Err(undo) = fs::remove_file(to) {
                warn!("Could not remove copy {:?} after failed move: {}", to, undo);
            }
            Err(QueueError::io(from, e))
        }
    }
}

fn scan_dir(area: RetentionArea, dir: &Path) -> Result<Vec<BatchRef>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(dir, e)),
    };

    let mut batches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| QueueError::io(dir, e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_batch_id) {
            batches.push(BatchRef {
                area,
                id,
                path: entry.path(),
            });
        }
    }

    batches.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
    Ok(batches)
}

fn batch_file_name(id: u64) -> String {
    format!("{}{:020}.{}", BATCH_PREFIX, id, BATCH_EXTENSION)
}

fn parse_batch_id(name: &str) -> Option<u64> {
    name.strip_prefix(BATCH_PREFIX)?
        .strip_suffix(BATCH_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn batch_disk_size(batch: &BatchRef) -> u64 {
    let len = |p: &Path| fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    len(batch.path()) + len(&batch.metadata_path())
}

fn exists(path: &Path) -> Result<bool> {
    path.try_exists().map_err(|e| QueueError::io(path, e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QueueError::io(path, e)),
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::framing::encode_frame;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn small_config() -> BatchConfig {
        BatchConfig {
            max_batch_size: 1024,
            max_batch_count: 3,
            max_batch_age_ms: 60_000,
            max_item_size: 256,
            max_disk_space: 1024 * 1024,
            ..Default::default()
        }
    }

    fn store_with(config: BatchConfig) -> (TempDir, BatchFileStore) {
        let dir = tempdir().unwrap();
        let store = BatchFileStore::open(dir.path(), "logs", config).unwrap();
        (dir, store)
    }

    fn read_all(store: &BatchFileStore, area: RetentionArea) -> Vec<Bytes> {
        store.close_open_batches();
        store
            .list_closed_batches(area)
            .unwrap()
            .iter()
            .flat_map(|b| store.read_batch(b).unwrap().events)
            .collect()
    }

    #[test]
    fn test_layout() {
        let (dir, store) = store_with(small_config());
        assert_eq!(store.dir(RetentionArea::Pending), dir.path().join("pending/logs"));
        assert_eq!(store.dir(RetentionArea::Approved), dir.path().join("approved/logs"));
        assert!(dir.path().join("pending/logs").is_dir());
    }

    #[test]
    fn test_file_names() {
        let name = batch_file_name(42);
        assert_eq!(name, "batch-00000000000000000042.bin");
        assert_eq!(parse_batch_id(&name), Some(42));
        assert_eq!(parse_batch_id("batch-00000000000000000042.meta"), None);
        assert_eq!(parse_batch_id("batch-00000000000000000042.tmp"), None);
        assert_eq!(parse_batch_id("other.bin"), None);
    }

    #[test]
    fn test_round_trip_in_order() {
        let (_dir, store) = store_with(small_config());
        for e in ["a", "b", "c"] {
            store.append(RetentionArea::Approved, &RawEvent::new(e)).unwrap();
        }
        assert_eq!(read_all(&store, RetentionArea::Approved), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_open_batch_not_listed() {
        let (_dir, store) = store_with(small_config());
        store.append(RetentionArea::Approved, &RawEvent::new("a")).unwrap();

        assert!(store.list_closed_batches(RetentionArea::Approved).unwrap().is_empty());

        store.close_open_batches();
        assert_eq!(store.list_closed_batches(RetentionArea::Approved).unwrap().len(), 1);
    }

    #[test]
    fn test_rollover_on_count() {
        let (_dir, store) = store_with(small_config());
        for i in 0..7 {
            store
                .append(RetentionArea::Approved, &RawEvent::new(format!("e{}", i)))
                .unwrap();
        }

        // 3 + 3 closed, 1 still open
        let closed = store.list_closed_batches(RetentionArea::Approved).unwrap();
        assert_eq!(closed.len(), 2);
        assert!(closed[0].id() < closed[1].id());
        assert_eq!(store.read_batch(&closed[0]).unwrap().events, vec!["e0", "e1", "e2"]);
    }

    #[test]
    fn test_rollover_on_size() {
        let (_dir, store) = store_with(BatchConfig {
            max_batch_size: 300,
            max_item_size: 204,
            max_batch_count: 100,
            ..small_config()
        });
        let payload = vec![7u8; 200];

        store.append(RetentionArea::Approved, &RawEvent::new(payload.clone())).unwrap();
        store.append(RetentionArea::Approved, &RawEvent::new(payload)).unwrap();

        assert_eq!(store.list_closed_batches(RetentionArea::Approved).unwrap().len(), 1);
    }

    #[test]
    fn test_rollover_on_age() {
        let (_dir, store) = store_with(BatchConfig {
            max_batch_age_ms: 0,
            ..small_config()
        });
        store.append(RetentionArea::Approved, &RawEvent::new("a")).unwrap();

        // An expired open batch is closed by the listing itself.
        assert_eq!(store.list_closed_batches(RetentionArea::Approved).unwrap().len(), 1);
    }

    #[test]
    fn test_item_too_large() {
        let (_dir, store) = store_with(small_config());

        // The limit applies to the frame, length prefix included.
        store
            .append(RetentionArea::Approved, &RawEvent::new(vec![0u8; 252]))
            .unwrap();
        let err = store
            .append(RetentionArea::Approved, &RawEvent::new(vec![0u8; 253]))
            .unwrap_err();
        assert!(matches!(err, QueueError::PayloadTooLarge { size: 257, max: 256 }));
        assert_eq!(read_all(&store, RetentionArea::Approved).len(), 1);
    }

    #[test]
    fn test_batches_stay_readable_after_item_limit_lowered() {
        let dir = tempdir().unwrap();
        let big = vec![5u8; 2048];
        {
            let store = BatchFileStore::open(dir.path(), "logs", BatchConfig::default()).unwrap();
            store.append(RetentionArea::Approved, &RawEvent::new(big.clone())).unwrap();
            store.close_open_batches();
        }

        let store = BatchFileStore::open(
            dir.path(),
            "logs",
            BatchConfig {
                max_item_size: 1024,
                ..BatchConfig::default()
            },
        )
        .unwrap();
        let batch = store.list_closed_batches(RetentionArea::Approved).unwrap().remove(0);
        assert_eq!(store.read_batch(&batch).unwrap().events, vec![Bytes::from(big)]);
    }

    #[test]
    fn test_failed_metadata_write_persists_nothing() {
        let (_dir, store) = store_with(small_config());
        store.append(RetentionArea::Approved, &RawEvent::new("a")).unwrap();

        // A directory in the way makes the metadata rename fail.
        let open_batch = fs::read_dir(store.dir(RetentionArea::Approved))
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().map_or(false, |ext| ext == BATCH_EXTENSION))
            .unwrap();
        let blocker = open_batch.with_extension(METADATA_EXTENSION);
        fs::create_dir(&blocker).unwrap();

        assert!(store
            .append(RetentionArea::Approved, &RawEvent::new("b").with_metadata("m"))
            .is_err());

        fs::remove_dir(&blocker).unwrap();
        store.append(RetentionArea::Approved, &RawEvent::new("c")).unwrap();
        assert_eq!(read_all(&store, RetentionArea::Approved), vec!["a", "c"]);
    }

    #[test]
    fn test_metadata_sibling() {
        let (_dir, store) = store_with(small_config());
        store
            .append(RetentionArea::Approved, &RawEvent::new("a").with_metadata("m1"))
            .unwrap();
        store
            .append(RetentionArea::Approved, &RawEvent::new("b").with_metadata("m2"))
            .unwrap();
        store.close_open_batches();

        let batch = &store.list_closed_batches(RetentionArea::Approved).unwrap()[0];
        let contents = store.read_batch(batch).unwrap();
        assert_eq!(contents.metadata.as_deref(), Some(&b"m2"[..]));
        assert_eq!(contents.payload_size(), 2);
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let (_dir, store) = store_with(small_config());
        store.append(RetentionArea::Approved, &RawEvent::new("whole")).unwrap();
        store.close_open_batches();

        let batch = store.list_closed_batches(RetentionArea::Approved).unwrap().remove(0);
        let mut file = fs::OpenOptions::new().append(true).open(batch.path()).unwrap();
        file.write_all(&encode_frame(b"torn")[..5]).unwrap();

        assert_eq!(store.read_batch(&batch).unwrap().events, vec!["whole"]);
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let (_dir, store) = store_with(small_config());
        let path = store.dir(RetentionArea::Approved).join(batch_file_name(1));
        fs::write(&path, [0xffu8; 16]).unwrap();

        let batch = store.list_closed_batches(RetentionArea::Approved).unwrap().remove(0);
        assert!(matches!(
            store.read_batch(&batch),
            Err(QueueError::CorruptData { .. })
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = store_with(small_config());
        store
            .append(RetentionArea::Approved, &RawEvent::new("a").with_metadata("m"))
            .unwrap();
        store.close_open_batches();

        let batch = store.list_closed_batches(RetentionArea::Approved).unwrap().remove(0);
        store.delete_batch(&batch).unwrap();
        store.delete_batch(&batch).unwrap();

        assert!(!batch.path().exists());
        assert!(!batch.metadata_path().exists());
    }

    #[test]
    fn test_move_batch() {
        let (_dir, store) = store_with(small_config());
        store
            .append(RetentionArea::Pending, &RawEvent::new("a").with_metadata("m"))
            .unwrap();
        store.close_open_batches();

        let batch = store.list_closed_batches(RetentionArea::Pending).unwrap().remove(0);
        let moved = store.move_batch(&batch, RetentionArea::Approved).unwrap().unwrap();

        assert_eq!(moved.area(), RetentionArea::Approved);
        assert_eq!(moved.id(), batch.id());
        assert!(!batch.path().exists());
        assert!(moved.metadata_path().exists());

        // A second move of the same ref is a no-op.
        assert!(store.move_batch(&batch, RetentionArea::Approved).unwrap().is_none());
    }

    #[test]
    fn test_move_all_includes_open_batch() {
        let (_dir, store) = store_with(small_config());
        for i in 0..5 {
            store
                .append(RetentionArea::Pending, &RawEvent::new(format!("p{}", i)))
                .unwrap();
        }

        let moved = store
            .move_all(RetentionArea::Pending, RetentionArea::Approved)
            .into_result()
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(store.stats(RetentionArea::Pending).unwrap().total_batches, 0);
        assert_eq!(
            read_all(&store, RetentionArea::Approved),
            vec!["p0", "p1", "p2", "p3", "p4"]
        );

        // Writes to pending start a fresh batch afterwards.
        store.append(RetentionArea::Pending, &RawEvent::new("late")).unwrap();
        assert_eq!(read_all(&store, RetentionArea::Pending), vec!["late"]);
    }

    #[test]
    fn test_moved_and_new_batches_keep_age_order() {
        let (_dir, store) = store_with(small_config());
        store.append(RetentionArea::Pending, &RawEvent::new("old")).unwrap();
        store.close_open_batches();
        store.append(RetentionArea::Approved, &RawEvent::new("new")).unwrap();
        store.close_open_batches();

        store.move_all(RetentionArea::Pending, RetentionArea::Approved);

        assert_eq!(read_all(&store, RetentionArea::Approved), vec!["old", "new"]);
    }

    #[test]
    fn test_wipe() {
        let (_dir, store) = store_with(small_config());
        for i in 0..4 {
            store
                .append(RetentionArea::Pending, &RawEvent::new(format!("p{}", i)))
                .unwrap();
        }

        assert_eq!(store.wipe(RetentionArea::Pending).into_result().unwrap(), 2);
        assert!(read_all(&store, RetentionArea::Pending).is_empty());
    }

    #[test]
    fn test_seal_bounds_move_and_wipe() {
        let (_dir, store) = store_with(small_config());
        store.append(RetentionArea::Pending, &RawEvent::new("before")).unwrap();

        let watermark = store.seal(RetentionArea::Pending);
        store.append(RetentionArea::Pending, &RawEvent::new("after")).unwrap();

        let moved = store
            .move_through(RetentionArea::Pending, RetentionArea::Approved, watermark)
            .into_result()
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(store.wipe_through(RetentionArea::Pending, watermark).transferred, 0);

        assert_eq!(read_all(&store, RetentionArea::Approved), vec!["before"]);
        assert_eq!(read_all(&store, RetentionArea::Pending), vec!["after"]);
    }

    #[test]
    fn test_relocate_copies_when_rename_fails() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("b.bin");
        fs::write(&from, encode_frame(b"payload")).unwrap();

        relocate_with(
            &from,
            &to,
            |_, _| Err(io::Error::new(io::ErrorKind::Other, "cross-device link")),
            |path| fs::remove_file(path),
        )
        .unwrap();

        assert!(!from.exists());
        assert!(!to.with_extension("tmp").exists());
        assert_eq!(fs::read(&to).unwrap(), encode_frame(b"payload"));
    }

    #[test]
    fn test_relocate_keeps_one_copy_when_source_delete_fails() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a.bin");
        let to = dir.path().join("b.bin");
        fs::write(&from, b"data").unwrap();

        let err = relocate_with(
            &from,
            &to,
            |_, _| Err(io::Error::new(io::ErrorKind::Other, "cross-device link")),
            |_| Err(io::Error::new(io::ErrorKind::Other, "busy")),
        )
        .unwrap_err();

        assert!(matches!(err, QueueError::TransientIo { .. }));
        assert!(from.exists());
        assert!(!to.exists());
    }

    #[test]
    fn test_write_event_routing() {
        let (_dir, store) = store_with(small_config());
        let consent = ConsentController::new(ConsentState::Pending);

        let status = store.write_event(&consent, &RawEvent::new("p")).unwrap();
        assert_eq!(status, WriteStatus::Written(RetentionArea::Pending));

        consent.set(ConsentState::Granted);
        let status = store.write_event(&consent, &RawEvent::new("g")).unwrap();
        assert_eq!(status, WriteStatus::Written(RetentionArea::Approved));

        consent.set(ConsentState::NotGranted);
        let status = store.write_event(&consent, &RawEvent::new("n")).unwrap();
        assert_eq!(status, WriteStatus::Dropped);

        assert_eq!(read_all(&store, RetentionArea::Pending), vec!["p"]);
        assert_eq!(read_all(&store, RetentionArea::Approved), vec!["g"]);
    }

    #[test]
    fn test_lease_skips_leased_batches() {
        let (_dir, store) = store_with(small_config());
        for i in 0..6 {
            store
                .append(RetentionArea::Approved, &RawEvent::new(format!("e{}", i)))
                .unwrap();
        }
        store.close_open_batches();

        let first = store.lease_oldest(RetentionArea::Approved).unwrap().unwrap();
        let second = store.lease_oldest(RetentionArea::Approved).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(store.lease_oldest(RetentionArea::Approved).unwrap().is_none());

        store.release(&first);
        assert_eq!(store.lease_oldest(RetentionArea::Approved).unwrap(), Some(first));
    }

    #[test]
    fn test_quota_evicts_oldest_first() {
        let (_dir, store) = store_with(BatchConfig {
            max_batch_size: 100,
            max_item_size: 64,
            max_batch_count: 1,
            max_disk_space: 150,
            ..small_config()
        });

        for i in 0..4u8 {
            store
                .append(RetentionArea::Approved, &RawEvent::new(vec![i; 60]))
                .unwrap();
        }
        store.close_open_batches();
        store.enforce_retention();

        let remaining: Vec<Bytes> = read_all(&store, RetentionArea::Approved);
        assert_eq!(remaining, vec![Bytes::from(vec![2u8; 60]), Bytes::from(vec![3u8; 60])]);
    }

    #[test]
    fn test_obsolete_batches_deleted() {
        let (_dir, store) = store_with(small_config());
        let stale = store.dir(RetentionArea::Approved).join(batch_file_name(1_000));
        fs::write(&stale, encode_frame(b"ancient")).unwrap();

        store.enforce_retention();
        assert!(!stale.exists());
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = tempdir().unwrap();
        let future_id = now_millis() + 1_000_000;
        let approved = dir.path().join("approved/logs");
        fs::create_dir_all(&approved).unwrap();
        fs::write(approved.join(batch_file_name(future_id)), encode_frame(b"x")).unwrap();

        let store = BatchFileStore::open(dir.path(), "logs", small_config()).unwrap();
        store.append(RetentionArea::Approved, &RawEvent::new("y")).unwrap();
        store.close_open_batches();

        let batches = store.list_closed_batches(RetentionArea::Approved).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].id(), future_id);
        assert!(batches[1].id() > future_id);
    }

    #[test]
    fn test_concurrent_appends_keep_every_event() {
        let (_dir, store) = store_with(BatchConfig {
            max_batch_count: 10,
            ..small_config()
        });
        let store = Arc::new(store);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .append(RetentionArea::Approved, &RawEvent::new(format!("{}-{}", t, i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = read_all(&store, RetentionArea::Approved);
        assert_eq!(events.len(), 100);

        // Per-thread append order is preserved.
        for t in 0..4 {
            let prefix = format!("{}-", t);
            let seq: Vec<usize> = events
                .iter()
                .filter_map(|e| std::str::from_utf8(e).ok()?.strip_prefix(&prefix)?.parse().ok())
                .collect();
            assert_eq!(seq, (0..25).collect::<Vec<_>>());
        }
    }
}
