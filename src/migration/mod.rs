// src/migration/mod.rs
//! Moving stored data when consent changes
//!
//! | previous | current    | migration        |
//! |----------|------------|------------------|
//! | Pending  | Granted    | move to approved |
//! | Pending  | NotGranted | wipe pending     |
//! | other    | other      | no-op            |
//!
//! ```text
//! ConsentController::set ──► ConsentMigrator (observer)
//!                                 │ seal pending areas, enqueue with watermarks
//!                                 ▼
//!                      serial migration task ──► RetryRunner ──► spawn_blocking(apply)
//! ```

pub mod migrator;

pub use migrator::{ConsentMigrator, Migration, MigrationStats};
