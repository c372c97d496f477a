// src/consent/mod.rs
//! Tracking consent
//!
//! - **State**: `Pending`, `Granted`, `NotGranted`
//! - **Controller**: owned consent slot passed by handle to every component
//!   that routes writes or migrates data; notifies observers on transitions
//!
//! ```text
//! set(new) ──► swap ──► previous != new ? ──► observer 1 ──► observer 2 ...
//!                              │ no
//!                              ▼
//!                           return
//! ```

pub mod controller;
pub mod state;

pub use controller::{ConsentController, ConsentObserver};
pub use state::ConsentState;
