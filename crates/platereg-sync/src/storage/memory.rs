//! In-memory registry store
//!
//! Used for dry runs and tests. Same transaction semantics as PostgreSQL:
//! writes go to a staged copy that replaces the live data on commit, and a
//! second concurrent `begin` is refused.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use super::{ClearMode, RegistryStore, RegistryTransaction};
use crate::error::{Result, SyncError};
use crate::models::VehicleRecord;

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub record: VehicleRecord,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    registry: BTreeMap<String, VehicleRecord>,
    history: Vec<HistoryRow>,
}

/// Registry and history held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistryStore {
    tables: Arc<Mutex<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed registry, ordered by plate
    pub fn registry(&self) -> Vec<VehicleRecord> {
        self.tables
            .lock()
            .map(|t| t.registry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed history, in insertion order
    pub fn history(&self) -> Vec<HistoryRow> {
        self.tables
            .lock()
            .map(|t| t.history.clone())
            .unwrap_or_default()
    }

    pub fn history_len(&self) -> usize {
        self.tables.lock().map(|t| t.history.len()).unwrap_or(0)
    }

    pub fn get(&self, plate: &str) -> Option<VehicleRecord> {
        self.tables
            .lock()
            .ok()
            .and_then(|t| t.registry.get(plate).cloned())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn RegistryTransaction>> {
        let guard = self
            .writer
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::SyncInProgress)?;

        let registry = self
            .tables
            .lock()
            .map_err(|e| SyncError::transaction("begin", e))?
            .registry
            .clone();

        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            registry,
            history: Vec::new(),
            _guard: guard,
        }))
    }
}

struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    /// Staged replacement for the live registry
    registry: BTreeMap<String, VehicleRecord>,
    /// Rows to append on commit
    history: Vec<HistoryRow>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl RegistryTransaction for MemoryTransaction {
    async fn clear_registry(&mut self, _mode: ClearMode) -> Result<()> {
        self.registry.clear();
        Ok(())
    }

    async fn append_history(
        &mut self,
        records: &[VehicleRecord],
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.history.extend(records.iter().map(|record| HistoryRow {
            record: record.clone(),
            created_at,
        }));
        Ok(records.len() as u64)
    }

    async fn upsert_registry(&mut self, records: &[VehicleRecord]) -> Result<u64> {
        for record in records {
            self.registry.insert(record.plate.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            tables,
            registry,
            history,
            _guard,
        } = *self;

        let mut live = tables.lock().map_err(|e| SyncError::transaction("commit", e))?;
        live.registry = registry;
        live.history.extend(history);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
