//! PostgreSQL registry store
//!
//! Table names come from validated configuration and are interpolated into
//! the SQL text; every value is bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};

use super::{ClearMode, RegistryStore, RegistryTransaction};
use crate::error::{Result, SyncError};
use crate::models::VehicleRecord;

/// `cars` / `car_history` tables in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
    registry_table: String,
    history_table: String,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool, registry_table: impl Into<String>, history_table: impl Into<String>) -> Self {
        Self {
            pool,
            registry_table: registry_table.into(),
            history_table: history_table.into(),
        }
    }

    /// Advisory lock name; one writer per registry table.
    fn lock_name(&self) -> String {
        format!("platereg-sync:{}", self.registry_table)
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn RegistryTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::transaction("begin", e))?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(self.lock_name())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| SyncError::transaction("lock", e))?;

        if !locked {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback after failed lock attempt failed");
            }
            return Err(SyncError::SyncInProgress);
        }

        debug!(lock = %self.lock_name(), "Acquired registry write lock");

        Ok(Box::new(PgRegistryTransaction {
            tx,
            registry_table: self.registry_table.clone(),
            history_table: self.history_table.clone(),
        }))
    }
}

struct PgRegistryTransaction {
    tx: Transaction<'static, Postgres>,
    registry_table: String,
    history_table: String,
}

#[async_trait]
impl RegistryTransaction for PgRegistryTransaction {
    async fn clear_registry(&mut self, mode: ClearMode) -> Result<()> {
        let sql = match mode {
            ClearMode::Truncate => format!("TRUNCATE TABLE {} RESTART IDENTITY", self.registry_table),
            ClearMode::DeleteAll => format!("DELETE FROM {}", self.registry_table),
        };

        let result = sqlx::query(&sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SyncError::transaction("registry clear", e))?;

        debug!(?mode, rows = result.rows_affected(), "Cleared registry");
        Ok(())
    }

    async fn append_history(
        &mut self,
        records: &[VehicleRecord],
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (plate, vin, make, model, year, engine_capacity, created_at) ",
            self.history_table
        ));

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(&record.plate)
                .push_bind(&record.vin)
                .push_bind(&record.make)
                .push_bind(&record.model)
                .push_bind(i32::from(record.year))
                .push_bind(&record.engine_capacity)
                .push_bind(created_at);
        });

        let result = query_builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SyncError::transaction("history insert", e))?;

        Ok(result.rows_affected())
    }

    async fn upsert_registry(&mut self, records: &[VehicleRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (plate, vin, make, model, year, engine_capacity) ",
            self.registry_table
        ));

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(&record.plate)
                .push_bind(&record.vin)
                .push_bind(&record.make)
                .push_bind(&record.model)
                .push_bind(i32::from(record.year))
                .push_bind(&record.engine_capacity);
        });

        query_builder.push(
            r#"
            ON CONFLICT (plate)
            DO UPDATE SET
                vin = EXCLUDED.vin,
                make = EXCLUDED.make,
                model = EXCLUDED.model,
                year = EXCLUDED.year,
                engine_capacity = EXCLUDED.engine_capacity
            "#,
        );

        let result = query_builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SyncError::transaction("registry insert", e))?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| SyncError::transaction("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| SyncError::transaction("rollback", e))
    }
}
