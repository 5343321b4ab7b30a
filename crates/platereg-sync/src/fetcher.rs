//! Archive download and data file selection
//!
//! The source publishes one ZIP that may hold several yearly CSV files. Only
//! the newest one (by the timestamp stored in the ZIP index) is imported.

use chrono::{NaiveDate, NaiveDateTime};
use reqwest::Client;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// The selected data file, decompressed
#[derive(Debug, Clone)]
pub struct DataFile {
    /// Entry path inside the archive
    pub name: String,
    /// Embedded modification time, if the archive recorded a valid one
    pub modified: Option<NaiveDateTime>,
    pub contents: Vec<u8>,
}

impl DataFile {
    /// Owned byte stream over the contents, for use on a blocking thread
    pub fn into_reader(self) -> impl Read + Send + 'static {
        Cursor::new(self.contents)
    }
}

/// Downloads the archive and extracts its newest data file
pub struct ArchiveFetcher {
    client: Client,
    url: String,
    config: SyncConfig,
}

impl ArchiveFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.source_url.clone(),
            config: config.clone(),
        })
    }

    /// Download the archive and decompress its newest data file.
    pub async fn fetch(&self) -> Result<DataFile> {
        let archive = self.download().await?;
        let extensions = self.config.data_file_extensions.clone();

        tokio::task::spawn_blocking(move || select_newest(archive, &extensions))
            .await
            .map_err(|e| SyncError::ArchiveCorrupt(format!("Archive task failed: {}", e)))?
    }

    /// Download the whole archive, retrying with exponential backoff.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn download(&self) -> Result<Vec<u8>> {
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.download_once().await {
                Ok(bytes) => {
                    info!(
                        bytes = bytes.len(),
                        "Downloaded archive ({} MB)",
                        bytes.len() / (1024 * 1024)
                    );
                    return Ok(bytes);
                },
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Download attempt failed");
                    last_error = e;

                    if attempt < attempts {
                        let backoff = self.config.retry_delay(attempt);
                        debug!(?backoff, "Retrying download");
                        tokio::time::sleep(backoff).await;
                    }
                },
            }
        }

        Err(SyncError::SourceUnavailable(format!(
            "Download of {} failed after {} attempts: {}",
            self.url, attempts, last_error
        )))
    }

    async fn download_once(&self) -> std::result::Result<Vec<u8>, String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }

        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

/// Pick the data file with the greatest `(modified, name)` and decompress it.
///
/// Only the ZIP index is scanned to choose; the other entries are never
/// inflated. `extensions` are lowercase, without the leading dot.
pub fn select_newest(archive: Vec<u8>, extensions: &[String]) -> Result<DataFile> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| SyncError::ArchiveCorrupt(format!("Failed to open ZIP: {}", e)))?;

    let mut newest: Option<(Option<NaiveDateTime>, String, usize)> = None;
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index).map_err(|e| {
            SyncError::ArchiveCorrupt(format!("Failed to read ZIP entry {}: {}", index, e))
        })?;

        if entry.is_dir() || !has_extension(entry.name(), extensions) {
            continue;
        }

        let modified: Option<zip::DateTime> = entry.last_modified().into();
        let modified = modified.and_then(to_naive);
        debug!(name = entry.name(), ?modified, "Candidate data file");

        let candidate = (modified, entry.name().to_string(), index);
        let newer = match &newest {
            None => true,
            Some((best_modified, best_name, _)) => {
                (&candidate.0, &candidate.1) > (best_modified, best_name)
            },
        };
        if newer {
            newest = Some(candidate);
        }
    }

    let (modified, name, index) = newest.ok_or_else(|| SyncError::NoDataFile {
        extensions: extensions.to_vec(),
    })?;

    let mut entry = zip
        .by_index(index)
        .map_err(|e| SyncError::ArchiveCorrupt(format!("Failed to open {}: {}", name, e)))?;
    let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry
        .read_to_end(&mut contents)
        .map_err(|e| SyncError::ArchiveCorrupt(format!("Failed to decompress {}: {}", name, e)))?;

    info!(
        file = %name,
        ?modified,
        bytes = contents.len(),
        "Selected data file"
    );

    Ok(DataFile {
        name,
        modified,
        contents,
    })
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

fn to_naive(dt: zip::DateTime) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?.and_hms_opt(
        dt.hour() as u32,
        dt.minute() as u32,
        dt.second() as u32,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn csv_only() -> Vec<String> {
        vec!["csv".to_string()]
    }

    #[test]
    fn test_no_data_file() {
        let bytes = archive(&[("readme.txt", "hello")]);
        let err = select_newest(bytes, &csv_only()).unwrap_err();
        assert!(matches!(err, SyncError::NoDataFile { .. }));
    }

    #[test]
    fn test_not_a_zip() {
        let err = select_newest(b"<html>maintenance</html>".to_vec(), &csv_only()).unwrap_err();
        assert!(matches!(err, SyncError::ArchiveCorrupt(_)));
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let bytes = archive(&[("data/TZ_2025.CSV", "N_REG_NEW\n"), ("notes.md", "x")]);
        let file = select_newest(bytes, &csv_only()).unwrap();
        assert_eq!(file.name, "data/TZ_2025.CSV");
        assert_eq!(file.contents, b"N_REG_NEW\n");
    }

    #[test]
    fn test_to_naive() {
        let dt = zip::DateTime::from_date_and_time(2025, 10, 1, 8, 30, 0).unwrap();
        assert_eq!(
            to_naive(dt).unwrap().to_string(),
            "2025-10-01 08:30:00"
        );
    }

    #[tokio::test]
    async fn test_download_retries_then_succeeds() {
        let server = MockServer::start().await;
        let body = archive(&[("a.csv", "x")]);

        Mock::given(method("GET"))
            .and(path("/registry.zip"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/registry.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let config = SyncConfig::default()
            .with_source_url(format!("{}/registry.zip", server.uri()))
            .with_retries(2, 1);
        let fetcher = ArchiveFetcher::new(&config).unwrap();

        assert_eq!(fetcher.download().await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_download_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(archive(&[("a.csv", "x")]))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let config = SyncConfig::default()
            .with_source_url(format!("{}/registry.zip", server.uri()))
            .with_retries(0, 1)
            .with_timeouts(30, 1);
        let started = std::time::Instant::now();
        let err = ArchiveFetcher::new(&config).unwrap().download().await.unwrap_err();

        assert!(matches!(err, SyncError::SourceUnavailable(_)), "{err}");
        assert!(err.to_string().contains("after 1 attempts"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_download_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let config = SyncConfig::default()
            .with_source_url(format!("{}/registry.zip", server.uri()))
            .with_retries(2, 1);
        let fetcher = ArchiveFetcher::new(&config).unwrap();

        let err = fetcher.download().await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
