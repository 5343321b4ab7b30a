//! Sync job configuration
//!
//! Values come from defaults, then `.env`, then `REGSYNC_*` / `DATABASE_*`
//! environment variables. Command-line flags are applied on top by the binary.

use platereg_common::env;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, SyncError};
use crate::storage::ClearMode;

// ============================================================================
// Source Constants
// ============================================================================

/// National vehicle registration dataset (ZIP of `;`-separated CSV files).
pub const DEFAULT_SOURCE_URL: &str = "https://data.gov.ua/dataset/0ffd8b75-0628-48cc-952a-9302f9799ec0/resource/3f13166f-090b-499e-8e23-e9851c5a5f67/download/reestrtz2025.zip";

/// Default User-Agent sent with HEAD and GET requests.
pub const DEFAULT_USER_AGENT: &str = concat!("platereg-sync/", env!("CARGO_PKG_VERSION"));

/// Default timeout for the change-detection HEAD request.
pub const DEFAULT_HEAD_TIMEOUT_SECS: u64 = 30;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default total timeout for the archive download (15 minutes).
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;

/// Default number of download retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential download backoff.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;

// ============================================================================
// Pipeline Constants
// ============================================================================

/// Records per multi-row INSERT statement.
pub const DEFAULT_BATCH_SIZE: usize = 2_000;

/// Bind parameters per registry/history row.
pub const PARAMS_PER_ROW: usize = 7;

/// PostgreSQL's bind parameter limit per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Rows buffered between the CSV reader and the persister.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8_192;

/// A sync accepting fewer records than this is rolled back.
pub const DEFAULT_MIN_ACCEPTED_ROWS: u64 = 1;

pub const DEFAULT_REGISTRY_TABLE: &str = "cars";
pub const DEFAULT_HISTORY_TABLE: &str = "car_history";
pub const DEFAULT_STATE_TABLE: &str = "registry_sync_state";
pub const DEFAULT_STATE_FILE: &str = "sync_state.json";

// ============================================================================
// Database Constants
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/platereg";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// What to do when the source fingerprint matches the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCheckMode {
    /// Skip the download when the fingerprint is unchanged
    #[default]
    SkipWhenUnchanged,
    /// Re-import on every run regardless of the fingerprint
    AlwaysResync,
}

impl std::str::FromStr for ChangeCheckMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "skip_when_unchanged" | "skip" => Ok(Self::SkipWhenUnchanged),
            "always_resync" | "always" => Ok(Self::AlwaysResync),
            _ => Err(format!("expected skip_when_unchanged or always_resync, got {}", s)),
        }
    }
}

/// What to do when the HEAD probe fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFailurePolicy {
    /// Fail the run with `SourceUnavailable`
    #[default]
    Abort,
    /// Proceed to download as if the source had changed
    AssumeChanged,
}

impl std::str::FromStr for DetectorFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(Self::Abort),
            "assume_changed" => Ok(Self::AssumeChanged),
            _ => Err(format!("expected abort or assume_changed, got {}", s)),
        }
    }
}

/// Where the last-seen fingerprint is kept between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateBackend {
    File { path: PathBuf },
    Database { table: String },
}

impl Default for StateBackend {
    fn default() -> Self {
        StateBackend::File {
            path: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }
}

/// CSV header names for each record field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub plate: String,
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: String,
    pub engine_capacity: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            plate: "N_REG_NEW".to_string(),
            vin: "VIN".to_string(),
            make: "BRAND".to_string(),
            model: "MODEL".to_string(),
            year: "MAKE_YEAR".to_string(),
            engine_capacity: "CAPACITY".to_string(),
        }
    }
}

impl ColumnMapping {
    /// Header names in record field order
    pub fn names(&self) -> [&str; 6] {
        [
            &self.plate,
            &self.vin,
            &self.make,
            &self.model,
            &self.year,
            &self.engine_capacity,
        ]
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Full configuration of one sync job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source_url: String,
    pub user_agent: String,
    pub head_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Lowercase file extensions, without the dot, treated as data files
    pub data_file_extensions: Vec<String>,
    pub columns: ColumnMapping,
    pub change_check: ChangeCheckMode,
    pub on_detector_failure: DetectorFailurePolicy,
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub clear_mode: ClearMode,
    pub min_accepted_rows: u64,
    pub registry_table: String,
    pub history_table: String,
    pub state: StateBackend,
    pub database: DatabaseConfig,
    /// Stop after this many data rows (smoke runs only)
    pub parse_limit: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            head_timeout_secs: DEFAULT_HEAD_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            data_file_extensions: vec!["csv".to_string()],
            columns: ColumnMapping::default(),
            change_check: ChangeCheckMode::default(),
            on_detector_failure: DetectorFailurePolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            clear_mode: ClearMode::default(),
            min_accepted_rows: DEFAULT_MIN_ACCEPTED_ROWS,
            registry_table: DEFAULT_REGISTRY_TABLE.to_string(),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            state: StateBackend::default(),
            database: DatabaseConfig::default(),
            parse_limit: None,
        }
    }
}

impl SyncConfig {
    /// Load from `.env` and the process environment, then validate.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let state = match env::var_opt("REGSYNC_STATE_BACKEND").as_deref() {
            None | Some("file") => StateBackend::File {
                path: env::var_opt("REGSYNC_STATE_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            },
            Some("database") | Some("db") => StateBackend::Database {
                table: env::var_opt("REGSYNC_STATE_TABLE")
                    .unwrap_or_else(|| DEFAULT_STATE_TABLE.to_string()),
            },
            Some(other) => anyhow::bail!(
                "Invalid value for REGSYNC_STATE_BACKEND: {:?} (expected file or database)",
                other
            ),
        };

        let data_file_extensions = match env::var_opt("REGSYNC_DATA_FILE_EXTENSIONS") {
            Some(raw) => raw
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            None => defaults.data_file_extensions,
        };

        let columns = ColumnMapping {
            plate: env::var_or("REGSYNC_COLUMN_PLATE", defaults.columns.plate)?,
            vin: env::var_or("REGSYNC_COLUMN_VIN", defaults.columns.vin)?,
            make: env::var_or("REGSYNC_COLUMN_MAKE", defaults.columns.make)?,
            model: env::var_or("REGSYNC_COLUMN_MODEL", defaults.columns.model)?,
            year: env::var_or("REGSYNC_COLUMN_YEAR", defaults.columns.year)?,
            engine_capacity: env::var_or("REGSYNC_COLUMN_CAPACITY", defaults.columns.engine_capacity)?,
        };

        let config = Self {
            source_url: env::var_or("REGSYNC_SOURCE_URL", defaults.source_url)?,
            user_agent: env::var_or("REGSYNC_USER_AGENT", defaults.user_agent)?,
            head_timeout_secs: env::var_or("REGSYNC_HEAD_TIMEOUT_SECS", defaults.head_timeout_secs)?,
            connect_timeout_secs: env::var_or(
                "REGSYNC_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            download_timeout_secs: env::var_or(
                "REGSYNC_DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout_secs,
            )?,
            max_retries: env::var_or("REGSYNC_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: env::var_or(
                "REGSYNC_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            data_file_extensions,
            columns,
            change_check: env::var_or("REGSYNC_CHANGE_CHECK", defaults.change_check)?,
            on_detector_failure: env::var_or(
                "REGSYNC_ON_DETECTOR_FAILURE",
                defaults.on_detector_failure,
            )?,
            batch_size: env::var_or("REGSYNC_BATCH_SIZE", defaults.batch_size)?,
            channel_capacity: env::var_or("REGSYNC_CHANNEL_CAPACITY", defaults.channel_capacity)?,
            clear_mode: env::var_or("REGSYNC_CLEAR_MODE", defaults.clear_mode)?,
            min_accepted_rows: env::var_or("REGSYNC_MIN_ACCEPTED_ROWS", defaults.min_accepted_rows)?,
            registry_table: env::var_or("REGSYNC_REGISTRY_TABLE", defaults.registry_table)?,
            history_table: env::var_or("REGSYNC_HISTORY_TABLE", defaults.history_table)?,
            state,
            database: DatabaseConfig {
                url: env::var_or("DATABASE_URL", defaults.database.url)?,
                max_connections: env::var_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
                connect_timeout_secs: env::var_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    defaults.database.connect_timeout_secs,
                )?,
            },
            parse_limit: env::var_opt("REGSYNC_PARSE_LIMIT")
                .map(|raw| {
                    raw.parse::<usize>()
                        .map_err(|e| anyhow::anyhow!("Invalid value for REGSYNC_PARSE_LIMIT: {:?} ({})", raw, e))
                })
                .transpose()?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = url.into();
        self
    }

    pub fn with_change_check(mut self, mode: ChangeCheckMode) -> Self {
        self.change_check = mode;
        self
    }

    pub fn with_detector_failure_policy(mut self, policy: DetectorFailurePolicy) -> Self {
        self.on_detector_failure = policy;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_min_accepted_rows(mut self, min: u64) -> Self {
        self.min_accepted_rows = min;
        self
    }

    pub fn with_state(mut self, state: StateBackend) -> Self {
        self.state = state;
        self
    }

    /// HEAD and GET timeouts, in seconds
    pub fn with_timeouts(mut self, head_secs: u64, download_secs: u64) -> Self {
        self.head_timeout_secs = head_secs;
        self.download_timeout_secs = download_secs;
        self
    }

    pub fn with_clear_mode(mut self, mode: ClearMode) -> Self {
        self.clear_mode = mode;
        self
    }

    pub fn with_parse_limit(mut self, limit: usize) -> Self {
        self.parse_limit = Some(limit);
        self
    }

    /// Check bounds and identifiers before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        let url = self.source_url.to_lowercase();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(SyncError::Config(format!(
                "Source URL must be http(s): {}",
                self.source_url
            )));
        }

        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be greater than 0".into()));
        }
        let params = self.batch_size.checked_mul(PARAMS_PER_ROW);
        if params.map_or(true, |p| p > MAX_BIND_PARAMS) {
            return Err(SyncError::Config(format!(
                "batch_size {} exceeds {} rows per statement ({} bind parameters max)",
                self.batch_size,
                MAX_BIND_PARAMS / PARAMS_PER_ROW,
                MAX_BIND_PARAMS
            )));
        }

        if self.channel_capacity == 0 {
            return Err(SyncError::Config("channel_capacity must be greater than 0".into()));
        }

        if self.head_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(SyncError::Config("HTTP timeouts must be greater than 0".into()));
        }

        if self.data_file_extensions.is_empty() {
            return Err(SyncError::Config("At least one data file extension is required".into()));
        }

        let columns = self.columns.names();
        if columns.iter().any(|c| c.trim().is_empty()) {
            return Err(SyncError::Config("Column names cannot be empty".into()));
        }

        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let mut tables = vec![&self.registry_table, &self.history_table];
        if let StateBackend::Database { table } = &self.state {
            tables.push(table);
        }
        for table in tables {
            if table.len() > 127 || !identifier.is_match(table) {
                return Err(SyncError::Config(format!("Invalid table name: {:?}", table)));
            }
        }
        if self.registry_table == self.history_table {
            return Err(SyncError::Config(
                "Registry and history tables must be different".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(SyncError::Config(
                "Database max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Initial delay before download retry `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        std::time::Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}
