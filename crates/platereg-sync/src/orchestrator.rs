//! Sync run orchestration
//!
//! One run walks through these phases:
//!
//! ```text
//! Idle -> CheckingChange -> Fetching -> Parsing -> Persisting -> UpdatingState -> Idle
//!              |
//!              +-> (unchanged) -> Idle
//! ```
//!
//! Any error returns the orchestrator to `Idle`. The registry transaction is
//! rolled back and the stored sync state is left as it was.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{ChangeCheckMode, DetectorFailurePolicy, SyncConfig};
use crate::dedup::BatchDeduplicator;
use crate::detector::{ChangeDecision, ChangeDetector};
use crate::error::{Result, SyncError};
use crate::fetcher::{ArchiveFetcher, DataFile};
use crate::models::{Fingerprint, PersistCounts, RejectionCounts, RowRejection, RunSummary};
use crate::normalizer::normalize;
use crate::parser::{ParsedRow, RegistryCsvReader};
use crate::state::{LastSuccess, SyncState, SyncStateStore};
use crate::storage::{persist_chunk, RegistryStore, RegistryTransaction};
use crate::validator::RecordValidator;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    CheckingChange,
    Fetching,
    Parsing,
    Persisting,
    UpdatingState,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::CheckingChange => "checking_change",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Parsing => "parsing",
            SyncPhase::Persisting => "persisting",
            SyncPhase::UpdatingState => "updating_state",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run options
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Import even if the source fingerprint is unchanged
    pub force: bool,
}

/// Result of a run that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Unchanged { fingerprint: Fingerprint },
    Synced(RunSummary),
}

/// Result of a change check without import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub source_url: String,
    pub previous: Option<Fingerprint>,
    pub current: Fingerprint,
    pub changed: bool,
}

/// Counters collected while consuming the row stream
#[derive(Debug, Default)]
struct StreamTotals {
    rows_read: u64,
    accepted: u64,
    rejected: RejectionCounts,
    persisted: PersistCounts,
}

/// Drives one registry sync at a time
pub struct SyncOrchestrator {
    config: SyncConfig,
    detector: ChangeDetector,
    fetcher: ArchiveFetcher,
    validator: RecordValidator,
    store: Arc<dyn RegistryStore>,
    state: Arc<dyn SyncStateStore>,
    phase: Mutex<SyncPhase>,
    dry_run: bool,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RegistryStore>,
        state: Arc<dyn SyncStateStore>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            detector: ChangeDetector::new(&config)?,
            fetcher: ArchiveFetcher::new(&config)?,
            validator: RecordValidator::new()?,
            config,
            store,
            state,
            phase: Mutex::new(SyncPhase::Idle),
            dry_run: false,
        })
    }

    /// Never save sync state; summaries are marked as dry runs.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *lock(&self.phase)
    }

    /// Probe the source and compare with the stored fingerprint, nothing else.
    #[instrument(skip(self), fields(source = %self.config.source_url))]
    pub async fn check(&self) -> Result<CheckReport> {
        let _guard = PhaseGuard::enter(&self.phase)?;

        let previous = self.previous_fingerprint().await;
        let current = self.detector.probe().await?;
        let changed = ChangeDetector::decide(previous.as_ref(), &current) == ChangeDecision::Changed;

        info!(changed, %current, "Checked source");

        Ok(CheckReport {
            source_url: self.config.source_url.clone(),
            previous,
            current,
            changed,
        })
    }

    /// Run one sync.
    ///
    /// Row problems are counted in the summary. Only run-level failures are
    /// returned as errors.
    #[instrument(skip(self), fields(source = %self.config.source_url, store = self.store.name()))]
    pub async fn run(&self, options: RunOptions) -> Result<SyncOutcome> {
        let guard = PhaseGuard::enter(&self.phase)?;
        let started_at = Utc::now();

        info!(force = options.force, dry_run = self.dry_run, "Starting registry sync");

        // 1. Change detection
        let previous = self.previous_fingerprint().await;
        let bypass = options.force || self.config.change_check == ChangeCheckMode::AlwaysResync;

        let fingerprint = match self.detector.probe().await {
            Ok(current) => {
                let decision = ChangeDetector::decide(previous.as_ref(), &current);
                if decision == ChangeDecision::Unchanged && !bypass {
                    info!(%current, "Source unchanged, skipping sync");
                    return Ok(SyncOutcome::Unchanged {
                        fingerprint: current,
                    });
                }
                debug!(?decision, bypass, "Proceeding with import");
                Some(current)
            },
            Err(e) if bypass => {
                warn!(error = %e, "Fingerprint probe failed, importing anyway and keeping the previous fingerprint");
                previous.clone()
            },
            Err(e) => match self.config.on_detector_failure {
                DetectorFailurePolicy::Abort => return Err(e),
                DetectorFailurePolicy::AssumeChanged => {
                    warn!(error = %e, "Fingerprint probe failed, assuming the source changed");
                    previous.clone()
                },
            },
        };

        // 2. Download and pick the data file
        guard.advance(SyncPhase::Fetching);
        let data_file = self.fetcher.fetch().await?;
        let source_file = data_file.name.clone();
        let source_file_modified = data_file.modified;

        // 3-4. Decode, validate and persist in one transaction
        let totals = self.import(data_file, &guard, started_at).await?;

        let finished_at = Utc::now();
        let summary = RunSummary {
            source_file,
            source_file_modified,
            fingerprint: fingerprint.clone(),
            rows_read: totals.rows_read,
            accepted: totals.accepted,
            history_rows: totals.persisted.history_rows,
            registry_rows: totals.persisted.registry_rows,
            rejected: totals.rejected,
            started_at,
            finished_at,
            dry_run: self.dry_run,
        };

        info!(
            file = %summary.source_file,
            rows_read = summary.rows_read,
            accepted = summary.accepted,
            history_rows = summary.history_rows,
            registry_rows = summary.registry_rows,
            empty_plate = summary.rejected.empty_plate,
            invalid_format = summary.rejected.invalid_format,
            duplicate_in_batch = summary.rejected.duplicate_in_batch,
            row_malformed = summary.rejected.row_malformed,
            duration_secs = summary.duration_secs(),
            "Registry sync committed"
        );

        // 5. Remember what was imported
        if self.dry_run {
            debug!("Dry run, sync state not updated");
        } else {
            guard.advance(SyncPhase::UpdatingState);
            let state = SyncState {
                source_url: self.config.source_url.clone(),
                fingerprint,
                last_success: Some(LastSuccess {
                    completed_at: finished_at,
                    source_file: summary.source_file.clone(),
                    summary: summary.clone(),
                }),
            };
            if let Err(e) = self.state.save(&state).await {
                error!(error = %e, "Registry committed but sync state could not be saved");
                return Err(e);
            }
        }

        Ok(SyncOutcome::Synced(summary))
    }

    /// Stored fingerprint for the configured URL. An unreadable state is
    /// treated as missing so the next successful run can replace it.
    async fn previous_fingerprint(&self) -> Option<Fingerprint> {
        match self.state.load(&self.config.source_url).await {
            Ok(state) => state.and_then(|s| s.fingerprint_for(&self.config.source_url).cloned()),
            Err(e) => {
                warn!(error = %e, "Could not load sync state, treating source as changed");
                None
            },
        }
    }

    async fn import(
        &self,
        data_file: DataFile,
        guard: &PhaseGuard<'_>,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<StreamTotals> {
        guard.advance(SyncPhase::Parsing);

        // Header check happens here, before the write lock is taken.
        let name = data_file.name.clone();
        let reader = RegistryCsvReader::new(data_file.into_reader(), name, &self.config.columns)?
            .with_limit(self.config.parse_limit);

        let (rows_tx, mut rows_rx) = mpsc::channel::<ParsedRow>(self.config.channel_capacity);
        let producer = tokio::task::spawn_blocking(move || reader.stream_into(rows_tx));

        guard.advance(SyncPhase::Persisting);
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                drop(rows_rx);
                let _ = producer.await;
                return Err(e);
            },
        };

        let consumed = self.consume(tx.as_mut(), &mut rows_rx, started_at).await;
        drop(rows_rx);

        let produced = producer
            .await
            .map_err(|e| SyncError::ArchiveCorrupt(format!("CSV reader task failed: {}", e)))
            .and_then(|read| read);

        let totals = match (consumed, produced) {
            (Ok(totals), Ok(_)) => totals,
            (Err(e), _) | (Ok(_), Err(e)) => return Err(rollback(tx, e).await),
        };

        if totals.accepted < self.config.min_accepted_rows {
            return Err(rollback(
                tx,
                SyncError::InsufficientRecords {
                    accepted: totals.accepted,
                    minimum: self.config.min_accepted_rows,
                },
            )
            .await);
        }

        tx.commit().await?;
        Ok(totals)
    }

    async fn consume(
        &self,
        tx: &mut dyn RegistryTransaction,
        rows: &mut mpsc::Receiver<ParsedRow>,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<StreamTotals> {
        let batch_size = self.config.batch_size;
        let mut totals = StreamTotals::default();
        let mut dedup = BatchDeduplicator::new();
        let mut chunk = Vec::with_capacity(batch_size);

        tx.clear_registry(self.config.clear_mode).await?;

        while let Some(row) = rows.recv().await {
            totals.rows_read += 1;

            let raw = match row {
                Ok(raw) => raw,
                Err(_) => {
                    totals.rejected.record(RowRejection::Malformed);
                    continue;
                },
            };

            let line = raw.line;
            let record = normalize(raw);
            let admitted = self
                .validator
                .validate(&record)
                .and_then(|()| dedup.admit(&record));
            if let Err(rejection) = admitted {
                trace!(line, plate = %record.plate, %rejection, "Rejected row");
                totals.rejected.record(rejection);
                continue;
            }

            totals.accepted += 1;
            chunk.push(record);

            if chunk.len() >= batch_size {
                let written = persist_chunk(tx, &chunk, started_at).await?;
                add_counts(&mut totals.persisted, written);
                chunk.clear();
                debug!(
                    rows_read = totals.rows_read,
                    accepted = totals.accepted,
                    "Persisted batch"
                );
            }
        }

        let written = persist_chunk(tx, &chunk, started_at).await?;
        add_counts(&mut totals.persisted, written);

        Ok(totals)
    }
}

fn add_counts(total: &mut PersistCounts, batch: PersistCounts) {
    total.history_rows += batch.history_rows;
    total.registry_rows += batch.registry_rows;
}

async fn rollback(tx: Box<dyn RegistryTransaction>, cause: SyncError) -> SyncError {
    warn!(error = %cause, kind = cause.kind(), "Rolling back registry transaction");
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
    cause
}

fn lock(phase: &Mutex<SyncPhase>) -> MutexGuard<'_, SyncPhase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the orchestrator busy; resets it to `Idle` when dropped.
struct PhaseGuard<'a> {
    phase: &'a Mutex<SyncPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a Mutex<SyncPhase>) -> Result<Self> {
        let mut current = lock(phase);
        if *current != SyncPhase::Idle {
            return Err(SyncError::AlreadyRunning { phase: *current });
        }
        *current = SyncPhase::CheckingChange;
        Ok(Self { phase })
    }

    fn advance(&self, next: SyncPhase) {
        *lock(self.phase) = next;
        debug!(phase = %next, "Entering phase");
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *lock(self.phase) = SyncPhase::Idle;
    }
}
