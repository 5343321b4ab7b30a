//! Platereg Registry Sync
//!
//! Keeps the `cars` table in step with the national vehicle registration
//! dataset, a ZIP archive of `;`-separated CSV files.
//!
//! # Pipeline
//!
//! ```text
//! ChangeDetector (HEAD) -> ArchiveFetcher (GET, newest .csv in the ZIP)
//!   -> RegistryCsvReader (blocking thread) -> bounded channel
//!   -> normalize -> RecordValidator -> BatchDeduplicator
//!   -> RegistryTransaction: clear, then per chunk append history + upsert registry
//!   -> commit -> SyncStateStore::save
//! ```
//!
//! A run either commits a complete new registry or changes nothing. Rows that
//! fail validation are counted per category in the [`RunSummary`], never
//! raised as errors.
//!
//! # Example
//!
//! ```rust,no_run
//! use platereg_sync::{
//!     FileSyncStateStore, MemoryRegistryStore, RunOptions, SyncConfig, SyncOrchestrator,
//!     SyncOutcome,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> platereg_sync::Result<()> {
//! let orchestrator = SyncOrchestrator::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryRegistryStore::new()),
//!     Arc::new(FileSyncStateStore::new("sync_state.json")),
//! )?;
//!
//! if let SyncOutcome::Synced(summary) = orchestrator.run(RunOptions::default()).await? {
//!     println!("{} plates imported", summary.registry_rows);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod dedup;
pub mod detector;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod parser;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod validator;

pub use config::{ChangeCheckMode, ColumnMapping, DetectorFailurePolicy, StateBackend, SyncConfig};
pub use error::{Result, SyncError};
pub use models::{Fingerprint, RejectionCounts, RowRejection, RunSummary, VehicleRecord};
pub use orchestrator::{CheckReport, RunOptions, SyncOrchestrator, SyncOutcome, SyncPhase};
pub use state::{FileSyncStateStore, PgSyncStateStore, SyncState, SyncStateStore};
pub use storage::{ClearMode, MemoryRegistryStore, PgRegistryStore, RegistryStore, RegistryTransaction};
