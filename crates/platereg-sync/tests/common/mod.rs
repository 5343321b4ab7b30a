//! Shared fixtures for the sync integration tests
#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use platereg_sync::storage::ClearMode;
use platereg_sync::{
    FileSyncStateStore, MemoryRegistryStore, RegistryStore, RegistryTransaction, SyncConfig,
    SyncError, SyncOrchestrator, VehicleRecord,
};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

pub const HEADER: &str = "PERSON;REG_ADDR_KOATUU;D_REG;BRAND;MODEL;VIN;MAKE_YEAR;COLOR;CAPACITY;N_REG_NEW";
pub const ARCHIVE_PATH: &str = "/dataset/reestrtz2025.zip";

/// One source row: (plate, vin, make, model, year, capacity)
pub type Row<'a> = (&'a str, &'a str, &'a str, &'a str, &'a str, &'a str);

/// CSV body in the publisher's column layout
pub fn registry_csv(rows: &[Row<'_>]) -> String {
    let mut csv = String::from(HEADER);
    csv.push('\n');
    for (plate, vin, make, model, year, capacity) in rows {
        csv.push_str(&format!(
            "P;8000000000;2025-03-01;{make};{model};{vin};{year};БІЛИЙ;{capacity};{plate}\n"
        ));
    }
    csv
}

/// ZIP with the given entries. `modified` is (year, month, day, hour, minute).
pub fn archive_with(entries: &[(&str, &str, (u16, u8, u8, u8, u8))]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body, (year, month, day, hour, minute)) in entries {
        let modified =
            zip::DateTime::from_date_and_time(*year, *month, *day, *hour, *minute, 0).unwrap();
        let options = SimpleFileOptions::default().last_modified_time(modified);
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Single-file archive
pub fn archive(csv: &str) -> Vec<u8> {
    archive_with(&[("reestr_tz_2025.csv", csv, (2025, 10, 1, 8, 0))])
}

/// Serve `archive` with the given ETag, replacing any previous mocks.
pub async fn serve(server: &MockServer, archive: Vec<u8>, etag: &str) {
    server.reset().await;
    Mock::given(method("HEAD"))
        .and(path(ARCHIVE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Last-Modified", "Wed, 01 Oct 2025 08:00:00 GMT")
                .insert_header("ETag", etag),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(ARCHIVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(server)
        .await;
}

pub fn config_for(server: &MockServer) -> SyncConfig {
    SyncConfig::default()
        .with_source_url(format!("{}{}", server.uri(), ARCHIVE_PATH))
        .with_retries(1, 1)
}

pub fn orchestrator(
    config: SyncConfig,
    store: Arc<dyn RegistryStore>,
    state_dir: &Path,
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        config,
        store,
        Arc::new(FileSyncStateStore::new(state_dir.join("sync_state.json"))),
    )
    .unwrap()
}

/// Memory store whose registry insert can be made to fail. Records the
/// clear mode of every transaction.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryRegistryStore,
    pub fail_registry_insert: Arc<AtomicBool>,
    pub clear_modes: Arc<Mutex<Vec<ClearMode>>>,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.fail_registry_insert.store(failing, Ordering::SeqCst);
    }

    pub fn clear_modes(&self) -> Vec<ClearMode> {
        self.clear_modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky-memory"
    }

    async fn begin(&self) -> platereg_sync::Result<Box<dyn RegistryTransaction>> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            fail: self.fail_registry_insert.load(Ordering::SeqCst),
            clear_modes: self.clear_modes.clone(),
        }))
    }
}

struct FlakyTransaction {
    inner: Box<dyn RegistryTransaction>,
    fail: bool,
    clear_modes: Arc<Mutex<Vec<ClearMode>>>,
}

#[async_trait]
impl RegistryTransaction for FlakyTransaction {
    async fn clear_registry(&mut self, mode: ClearMode) -> platereg_sync::Result<()> {
        self.clear_modes.lock().unwrap().push(mode);
        self.inner.clear_registry(mode).await
    }

    async fn append_history(
        &mut self,
        records: &[VehicleRecord],
        created_at: DateTime<Utc>,
    ) -> platereg_sync::Result<u64> {
        self.inner.append_history(records, created_at).await
    }

    async fn upsert_registry(&mut self, records: &[VehicleRecord]) -> platereg_sync::Result<u64> {
        if self.fail {
            return Err(SyncError::transaction("registry insert", "connection reset by peer"));
        }
        self.inner.upsert_registry(records).await
    }

    async fn commit(self: Box<Self>) -> platereg_sync::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> platereg_sync::Result<()> {
        self.inner.rollback().await
    }
}
