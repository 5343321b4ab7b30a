//! Registry persistence
//!
//! A sync writes through exactly one [`RegistryTransaction`]: clear the
//! current registry, then for each chunk append history and upsert the
//! registry, then commit. Readers keep seeing the previous registry until the
//! commit, and a failed run leaves no trace.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{PersistCounts, VehicleRecord};

pub use memory::{HistoryRow, MemoryRegistryStore};
pub use postgres::PgRegistryStore;

/// How the current registry is emptied at the start of a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClearMode {
    /// `DELETE FROM ...`. Readers keep their snapshot of the old rows and
    /// are never blocked; the table needs vacuuming afterwards.
    #[default]
    DeleteAll,
    /// `TRUNCATE ... RESTART IDENTITY`. Faster, but holds an ACCESS EXCLUSIVE
    /// lock until commit and is not MVCC-safe: a REPEATABLE READ reader whose
    /// snapshot predates the commit sees an empty registry afterwards.
    Truncate,
}

impl std::str::FromStr for ClearMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "truncate" => Ok(ClearMode::Truncate),
            "delete" | "delete_all" => Ok(ClearMode::DeleteAll),
            _ => Err(format!("expected truncate or delete_all, got {}", s)),
        }
    }
}

/// Backend holding the current registry and its history
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Open the write transaction and take the single-writer guard.
    ///
    /// Fails with `SyncInProgress` when another writer holds the guard.
    async fn begin(&self) -> Result<Box<dyn RegistryTransaction>>;
}

/// One open write transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait RegistryTransaction: Send {
    async fn clear_registry(&mut self, mode: ClearMode) -> Result<()>;

    /// Append rows to the history table, all stamped `created_at`.
    async fn append_history(
        &mut self,
        records: &[VehicleRecord],
        created_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Insert into the current registry, overwriting any row with the same
    /// plate (the later record wins).
    async fn upsert_registry(&mut self, records: &[VehicleRecord]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Write one chunk: history first, then the registry.
pub async fn persist_chunk(
    tx: &mut dyn RegistryTransaction,
    records: &[VehicleRecord],
    created_at: DateTime<Utc>,
) -> Result<PersistCounts> {
    if records.is_empty() {
        return Ok(PersistCounts::default());
    }

    let history_rows = tx.append_history(records, created_at).await?;
    let registry_rows = tx.upsert_registry(records).await?;

    Ok(PersistCounts {
        history_rows,
        registry_rows,
    })
}
