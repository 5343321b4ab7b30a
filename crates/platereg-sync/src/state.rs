//! Persisted sync state
//!
//! Remembers the fingerprint of the last successfully imported source so an
//! unchanged source can be skipped. Written only after the registry commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::{Fingerprint, RunSummary};

/// Details of the last committed sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSuccess {
    pub completed_at: DateTime<Utc>,
    pub source_file: String,
    pub summary: RunSummary,
}

/// State stored per source URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub source_url: String,
    pub fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub last_success: Option<LastSuccess>,
}

impl SyncState {
    /// Fingerprint to compare against, ignored if recorded for another URL.
    pub fn fingerprint_for(&self, source_url: &str) -> Option<&Fingerprint> {
        if self.source_url == source_url {
            self.fingerprint.as_ref()
        } else {
            None
        }
    }
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// State for `source_url`, `None` if nothing was ever saved.
    async fn load(&self, source_url: &str) -> Result<Option<SyncState>>;

    async fn save(&self, state: &SyncState) -> Result<()>;
}

/// JSON file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileSyncStateStore {
    path: PathBuf,
}

impl FileSyncStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sync_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SyncStateStore for FileSyncStateStore {
    async fn load(&self, source_url: &str) -> Result<Option<SyncState>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No sync state file yet");
                return Ok(None);
            },
            Err(e) => {
                return Err(SyncError::State(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            },
        };

        let state: SyncState = serde_json::from_slice(&raw).map_err(|e| {
            SyncError::State(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        if state.source_url != source_url {
            warn!(
                stored = %state.source_url,
                configured = %source_url,
                "Sync state belongs to a different source URL, ignoring its fingerprint"
            );
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::State(format!("Failed to serialize sync state: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::State(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| SyncError::State(format!("Failed to write {}: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            SyncError::State(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), "Saved sync state");
        Ok(())
    }
}

/// Row per source URL in a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PgSyncStateStore {
    pool: PgPool,
    table: String,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    source_url: String,
    last_modified: Option<String>,
    etag: Option<String>,
    last_success: Option<Json<LastSuccess>>,
}

impl PgSyncStateStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl SyncStateStore for PgSyncStateStore {
    async fn load(&self, source_url: &str) -> Result<Option<SyncState>> {
        let sql = format!(
            "SELECT source_url, last_modified, etag, last_success FROM {} WHERE source_url = $1",
            self.table
        );

        let row: Option<StateRow> = sqlx::query_as(&sql)
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::State(format!("Failed to load sync state: {}", e)))?;

        Ok(row.map(|row| {
            let fingerprint = Fingerprint {
                last_modified: row.last_modified,
                etag: row.etag,
            };
            SyncState {
                source_url: row.source_url,
                fingerprint: (!fingerprint.is_empty()).then_some(fingerprint),
                last_success: row.last_success.map(|Json(s)| s),
            }
        }))
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (source_url, last_modified, etag, last_success, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (source_url)
            DO UPDATE SET
                last_modified = EXCLUDED.last_modified,
                etag = EXCLUDED.etag,
                last_success = EXCLUDED.last_success,
                updated_at = NOW()
            "#,
            self.table
        );

        let fingerprint = state.fingerprint.clone().unwrap_or_default();
        sqlx::query(&sql)
            .bind(&state.source_url)
            .bind(fingerprint.last_modified)
            .bind(fingerprint.etag)
            .bind(state.last_success.as_ref().map(Json))
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::State(format!("Failed to save sync state: {}", e)))?;

        Ok(())
    }
}
