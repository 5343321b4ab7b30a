//! Source change detection via HTTP validators

use reqwest::header::{HeaderMap, ETAG, LAST_MODIFIED};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::Fingerprint;

/// Outcome of comparing the stored and current fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Unchanged,
    Changed,
}

/// Sends a HEAD request and reads `Last-Modified` / `ETag`
pub struct ChangeDetector {
    client: Client,
    url: String,
}

impl ChangeDetector {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.head_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.source_url.clone(),
        })
    }

    /// Fetch the current fingerprint of the source.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn probe(&self) -> Result<Fingerprint> {
        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable(format!("HEAD {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable(format!(
                "HEAD {} returned HTTP {}",
                self.url, status
            )));
        }

        let fingerprint = fingerprint_from_headers(response.headers())?;
        if fingerprint.is_empty() {
            return Err(SyncError::SourceUnavailable(format!(
                "HEAD {} returned neither Last-Modified nor ETag",
                self.url
            )));
        }

        debug!(%fingerprint, "Probed source");
        Ok(fingerprint)
    }

    /// Compare against the fingerprint stored by the last successful run.
    pub fn decide(previous: Option<&Fingerprint>, current: &Fingerprint) -> ChangeDecision {
        match previous {
            Some(prev) if prev == current => ChangeDecision::Unchanged,
            _ => ChangeDecision::Changed,
        }
    }
}

fn fingerprint_from_headers(headers: &HeaderMap) -> Result<Fingerprint> {
    let header = |name: reqwest::header::HeaderName| -> Result<Option<String>> {
        headers
            .get(&name)
            .map(|value| {
                value.to_str().map(|s| s.trim().to_string()).map_err(|_| {
                    SyncError::SourceUnavailable(format!("Header {} is not valid text", name))
                })
            })
            .transpose()
    };

    Ok(Fingerprint {
        last_modified: header(LAST_MODIFIED)?.filter(|v| !v.is_empty()),
        etag: header(ETAG)?.filter(|v| !v.is_empty()),
    })
}
