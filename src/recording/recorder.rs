// src/recording/recorder.rs
//! Producer-facing event recorder
//!
//! Serializes domain events and hands the bytes to the batch store under the
//! current consent.

use crate::consent::ConsentController;
use crate::observability::names;
use crate::recording::storage::{BatchFileStore, RawEvent, RetentionArea, WriteStatus};
use crate::utils::errors::Result;
use bytes::Bytes;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

/// Turns a domain event into bytes
///
/// Returning `None` drops the event; it is not retried.
pub trait Serializer: Send + Sync {
    type Event;

    fn serialize(&self, event: &Self::Event) -> Option<Bytes>;

    /// Batch metadata to attach alongside the event, if any
    fn metadata(&self, _event: &Self::Event) -> Option<Bytes> {
        None
    }
}

/// JSON serializer for any `Serialize` event
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn(&T)>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serializer for JsonSerializer<T> {
    type Event = T;

    fn serialize(&self, event: &T) -> Option<Bytes> {
        match serde_json::to_vec(event) {
            Ok(json) => Some(Bytes::from(json)),
            Err(e) => {
                warn!("Dropping event that failed to serialize: {}", e);
                None
            }
        }
    }
}

/// What happened to a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Written(RetentionArea),
    DroppedByConsent,
    DroppedBySerializer,
}

/// Serializing front end to one batch store
pub struct EventRecorder<S: Serializer> {
    serializer: S,
    store: Arc<BatchFileStore>,
    consent: Arc<ConsentController>,
    stats: StatsCounters,
}

#[derive(Default)]
struct StatsCounters {
    events_recorded: AtomicU64,
    dropped_by_consent: AtomicU64,
    dropped_by_serializer: AtomicU64,
    write_failures: AtomicU64,
    total_record_time_ns: AtomicU64,
}

impl<S: Serializer> EventRecorder<S> {
    pub fn new(serializer: S, store: Arc<BatchFileStore>, consent: Arc<ConsentController>) -> Self {
        Self {
            serializer,
            store,
            consent,
            stats: StatsCounters::default(),
        }
    }

    /// Serialize and persist an event
    ///
    /// Write failures are returned so the producer can decide to drop or retry.
    pub fn record(&self, event: &S::Event) -> Result<RecordOutcome> {
        let start = Instant::now();

        let Some(data) = self.serializer.serialize(event) else {
            self.stats.dropped_by_serializer.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(names::EVENTS_SERIALIZATION_DROPPED).increment(1);
            return Ok(RecordOutcome::DroppedBySerializer);
        };

        let raw = RawEvent {
            data,
            metadata: self.serializer.metadata(event),
        };

        let outcome = match self.store.write_event(&self.consent, &raw) {
            Ok(WriteStatus::Written(area)) => {
                self.stats.events_recorded.fetch_add(1, Ordering::Relaxed);
                RecordOutcome::Written(area)
            }
            Ok(WriteStatus::Dropped) => {
                self.stats.dropped_by_consent.fetch_add(1, Ordering::Relaxed);
                RecordOutcome::DroppedByConsent
            }
            Err(err) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let elapsed = start.elapsed().as_nanos() as u64;
        self.stats
            .total_record_time_ns
            .fetch_add(elapsed, Ordering::Relaxed);
        trace!("Recorded event in {}ns: {:?}", elapsed, outcome);

        Ok(outcome)
    }

    pub fn store(&self) -> &Arc<BatchFileStore> {
        &self.store
    }

    /// Snapshot of recorder statistics
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            events_recorded: self.stats.events_recorded.load(Ordering::Relaxed),
            dropped_by_consent: self.stats.dropped_by_consent.load(Ordering::Relaxed),
            dropped_by_serializer: self.stats.dropped_by_serializer.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
            total_record_time_ns: self.stats.total_record_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// Recorder statistics
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    pub events_recorded: u64,
    pub dropped_by_consent: u64,
    pub dropped_by_serializer: u64,
    pub write_failures: u64,
    pub total_record_time_ns: u64,
}

impl RecorderStats {
    pub fn avg_record_time_ns(&self) -> u64 {
        let handled = self.events_recorded + self.dropped_by_consent;
        if handled == 0 {
            0
        } else {
            self.total_record_time_ns / handled
        }
    }
}
