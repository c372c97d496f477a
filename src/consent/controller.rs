// src/consent/controller.rs
//! Owned consent slot with ordered change notification
//!
//! Reads go through an atomic and never block. Writes and the observer list
//! share one mutex, so observers see transitions in the order they were
//! applied. Observers run while that mutex is held: they must not call
//! [`ConsentController::set`] themselves.

use crate::consent::state::ConsentState;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Callback invoked on every actual consent transition
pub trait ConsentObserver: Send + Sync {
    fn on_consent_changed(&self, previous: ConsentState, current: ConsentState);
}

impl<F> ConsentObserver for F
where
    F: Fn(ConsentState, ConsentState) + Send + Sync,
{
    fn on_consent_changed(&self, previous: ConsentState, current: ConsentState) {
        self(previous, current)
    }
}

/// Consent holder shared by every component that routes or migrates data
pub struct ConsentController {
    /// Current value, readable without locking
    current: AtomicU8,

    /// Serializes `set` and guards the observer list
    observers: Mutex<Vec<Arc<dyn ConsentObserver>>>,
}

impl ConsentController {
    /// Create a controller starting at `initial`
    pub fn new(initial: ConsentState) -> Self {
        Self {
            current: AtomicU8::new(initial.as_u8()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Current consent
    pub fn get(&self) -> ConsentState {
        ConsentState::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Change consent, notifying observers if the value actually changed
    pub fn set(&self, new: ConsentState) {
        let observers = self.observers.lock();

        let previous = ConsentState::from_u8(self.current.swap(new.as_u8(), Ordering::AcqRel));
        if previous == new {
            debug!("Consent unchanged ({})", new);
            return;
        }

        info!("Consent changed: {} -> {}", previous, new);

        for (index, observer) in observers.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_consent_changed(previous, new)
            }));
            if result.is_err() {
                error!(
                    observer = index,
                    "Consent observer panicked on {} -> {}; continuing", previous, new
                );
            }
        }
    }

    /// Register an observer; it is called after every later transition
    pub fn register_observer(&self, observer: Arc<dyn ConsentObserver>) {
        self.observers.lock().push(observer);
    }

    /// Remove every registered observer
    pub fn clear_observers(&self) {
        self.observers.lock().clear();
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl Default for ConsentController {
    fn default() -> Self {
        Self::new(ConsentState::default())
    }
}

impl std::fmt::Debug for ConsentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentController")
            .field("current", &self.get())
            .finish()
    }
}
