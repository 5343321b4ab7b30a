//! Run-level error types
//!
//! Only failures that abort a whole sync live here. Problems with individual
//! source rows are [`RowRejection`](crate::models::RowRejection) values and are
//! counted, never raised.

use thiserror::Error;

use crate::orchestrator::SyncPhase;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Fatal error for one sync run. The registry is left as the previous
/// successful run committed it and the stored sync state is not touched.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or metadata failure talking to the source.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("No data file in archive (looked for extensions {extensions:?})")]
    NoDataFile { extensions: Vec<String> },

    #[error("Data file {file} is missing required columns: {missing:?}")]
    MissingColumns { file: String, missing: Vec<String> },

    /// Storage failure while persisting; the transaction was rolled back.
    #[error("Transaction failed during {stage}: {message}")]
    TransactionFailed { stage: &'static str, message: String },

    /// The batch is too small to replace the registry with.
    #[error("Only {accepted} records accepted, at least {minimum} required to replace the registry")]
    InsufficientRecords { accepted: u64, minimum: u64 },

    /// Another process holds the registry write lock.
    #[error("Another sync holds the registry write lock")]
    SyncInProgress,

    /// This orchestrator instance is already running a sync.
    #[error("Sync already running (phase: {phase})")]
    AlreadyRunning { phase: SyncPhase },

    #[error("Sync state error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn transaction(stage: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::TransactionFailed {
            stage,
            message: err.to_string(),
        }
    }

    /// Whether the next scheduled run may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SourceUnavailable(_)
            | SyncError::ArchiveCorrupt(_)
            | SyncError::NoDataFile { .. }
            | SyncError::TransactionFailed { .. }
            | SyncError::InsufficientRecords { .. }
            | SyncError::SyncInProgress
            | SyncError::AlreadyRunning { .. }
            | SyncError::State(_) => true,
            SyncError::MissingColumns { .. } | SyncError::Config(_) => false,
        }
    }

    /// Stable short name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::ArchiveCorrupt(_) => "archive_corrupt",
            SyncError::NoDataFile { .. } => "no_data_file",
            SyncError::MissingColumns { .. } => "missing_columns",
            SyncError::TransactionFailed { .. } => "transaction_failed",
            SyncError::InsufficientRecords { .. } => "insufficient_records",
            SyncError::SyncInProgress => "sync_in_progress",
            SyncError::AlreadyRunning { .. } => "already_running",
            SyncError::State(_) => "state",
            SyncError::Config(_) => "config",
        }
    }
}
