//! Registry data models

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One source row as decoded from the CSV, before normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line of the record in the data file (header is line 1)
    pub line: u64,
    pub plate: String,
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: String,
    pub engine_capacity: String,
}

/// Canonical vehicle record, keyed by plate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Uppercase, Cyrillic look-alikes mapped to Latin (e.g. "AB1234CE")
    pub plate: String,
    /// May be empty
    pub vin: String,
    pub make: String,
    pub model: String,
    /// 0 means unknown, never a real model year
    pub year: u16,
    /// Free-form as published (e.g. "1998"), may be empty
    pub engine_capacity: String,
}

impl VehicleRecord {
    pub fn year_known(&self) -> bool {
        self.year != 0
    }
}

/// Why a row was dropped. Counted per run, never raised as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRejection {
    EmptyPlate,
    InvalidFormat,
    DuplicateInBatch,
    /// Unreadable row: wrong field count or invalid UTF-8
    Malformed,
}

impl RowRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowRejection::EmptyPlate => "empty_plate",
            RowRejection::InvalidFormat => "invalid_format",
            RowRejection::DuplicateInBatch => "duplicate_in_batch",
            RowRejection::Malformed => "row_malformed",
        }
    }
}

impl std::fmt::Display for RowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category rejection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub empty_plate: u64,
    pub invalid_format: u64,
    pub duplicate_in_batch: u64,
    pub row_malformed: u64,
}

impl RejectionCounts {
    pub fn record(&mut self, rejection: RowRejection) {
        match rejection {
            RowRejection::EmptyPlate => self.empty_plate += 1,
            RowRejection::InvalidFormat => self.invalid_format += 1,
            RowRejection::DuplicateInBatch => self.duplicate_in_batch += 1,
            RowRejection::Malformed => self.row_malformed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.empty_plate + self.invalid_format + self.duplicate_in_batch + self.row_malformed
    }
}

/// Change-detection validators reported by the source
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl Fingerprint {
    pub fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.etag.is_none()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "last-modified={} etag={}",
            self.last_modified.as_deref().unwrap_or("-"),
            self.etag.as_deref().unwrap_or("-")
        )
    }
}

/// Rows written by one persisted batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistCounts {
    pub history_rows: u64,
    pub registry_rows: u64,
}

/// Result of one committed sync, suitable for logging and alerting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Data file selected inside the archive
    pub source_file: String,
    /// Its embedded modification time, when the archive records one
    pub source_file_modified: Option<NaiveDateTime>,
    pub fingerprint: Option<Fingerprint>,
    /// Data rows read from the file, including rejected ones
    pub rows_read: u64,
    pub accepted: u64,
    pub history_rows: u64,
    pub registry_rows: u64,
    pub rejected: RejectionCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when written to the in-memory store instead of the database
    #[serde(default)]
    pub dry_run: bool,
}

impl RunSummary {
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_counts() {
        let mut counts = RejectionCounts::default();
        counts.record(RowRejection::EmptyPlate);
        counts.record(RowRejection::InvalidFormat);
        counts.record(RowRejection::InvalidFormat);
        counts.record(RowRejection::DuplicateInBatch);

        assert_eq!(counts.empty_plate, 1);
        assert_eq!(counts.invalid_format, 2);
        assert_eq!(counts.duplicate_in_batch, 1);
        assert_eq!(counts.row_malformed, 0);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_fingerprint_display() {
        let fp = Fingerprint {
            last_modified: Some("Wed, 01 Oct 2025 08:00:00 GMT".into()),
            etag: None,
        };
        assert_eq!(fp.to_string(), "last-modified=Wed, 01 Oct 2025 08:00:00 GMT etag=-");
        assert!(!fp.is_empty());
        assert!(Fingerprint::default().is_empty());
    }

    #[test]
    fn test_summary_duration() {
        let started_at = Utc::now();
        let summary = RunSummary {
            source_file: "reestr_tz_2025.csv".into(),
            source_file_modified: None,
            fingerprint: None,
            rows_read: 3,
            accepted: 2,
            history_rows: 2,
            registry_rows: 2,
            rejected: RejectionCounts::default(),
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(2_500),
            dry_run: false,
        };
        assert_eq!(summary.duration_secs(), 2.5);
    }

    #[test]
    fn test_rejection_serializes_snake_case() {
        let json = serde_json::to_string(&RowRejection::DuplicateInBatch).unwrap();
        assert_eq!(json, "\"duplicate_in_batch\"");
    }
}
