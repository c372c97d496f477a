// src/runtime/mod.rs
//! Background execution helpers
//!
//! - **Retry**: bounded retry with a fixed, cancellable delay, shared by the
//!   consent migrator and the upload worker

pub mod retry;

// Re-export commonly used types
pub use retry::{RetryPolicy, RetryRunner};
