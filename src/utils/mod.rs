// src/utils/mod.rs
//! Configuration and error types shared across the crate

pub mod config;
pub mod errors;

pub use config::QueueConfig;
pub use errors::{QueueError, Result, Retryable, WriteError};
