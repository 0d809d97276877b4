//! Source fetcher: pull one partition's compressed CSV over HTTP and stage
//! the decompressed bytes on local disk.
//!
//! Transient failures (timeouts, connection errors, 5xx) are retried a fixed
//! number of times with exponential backoff. Permanent failures (4xx, bad
//! gzip payload) fail the run immediately. Re-staging the same partition
//! overwrites the previous file, so a crashed run leaves nothing stale
//! behind.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::error::IngestError;
use crate::params::RunParams;

const SOURCE_BASE_URL: &str = "https://github.com/DataTalksClub/nyc-tlc-data/releases/download";

/// Upstream release URL for one partition, e.g.
/// `.../download/yellow/yellow_tripdata_2020-01.csv.gz`.
pub fn source_url(params: &RunParams) -> String {
    format!(
        "{SOURCE_BASE_URL}/{}/{}.csv.gz",
        params.kind(),
        params.file_stem()
    )
}

/// A staged partition file, ready for normalization.
#[derive(Debug)]
pub struct StagedPartition {
    pub path: PathBuf,
    /// File name recorded as row provenance, e.g. `yellow_tripdata_2020-01.csv`.
    pub source_file: String,
    /// Data rows in the staged file, counted before any parsing.
    pub raw_rows: u64,
}

/// The pipeline's view of "get me this partition's bytes". Tests substitute
/// a local fixture; production uses [`HttpFetcher`].
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, params: &RunParams) -> Result<StagedPartition, IngestError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

enum AttemptError {
    Transient(String),
    Permanent(String),
}

pub struct HttpFetcher {
    client: reqwest::Client,
    staging_dir: PathBuf,
    max_attempts: u32,
    backoff_base: Duration,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        staging_dir: PathBuf,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            client,
            staging_dir,
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Downloads the body, returning it along with the number of attempts
    /// that ended up being spent.
    async fn download(&self, url: &str) -> Result<(Vec<u8>, u32), IngestError> {
        let mut last_reason = String::from("no attempts made");
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.backoff_base, attempt);
                info!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
            match self.attempt(url).await {
                Ok(body) => return Ok((body, attempt)),
                Err(AttemptError::Permanent(reason)) => {
                    return Err(IngestError::Fetch {
                        url: url.to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(AttemptError::Transient(reason)) => {
                    warn!(url, attempt, reason = reason.as_str(), "transient fetch failure");
                    last_reason = reason;
                }
            }
        }
        Err(IngestError::Fetch {
            url: url.to_string(),
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            // 4xx means the partition does not exist upstream (or we are
            // asking wrongly); more attempts cannot change the answer.
            return Err(AttemptError::Permanent(format!("status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Transient(format!("body read: {e}")))?;
        Ok(body.to_vec())
    }
}

fn classify_request_error(error: reqwest::Error) -> AttemptError {
    if error.is_timeout() || error.is_connect() {
        AttemptError::Transient(error.to_string())
    } else {
        AttemptError::Permanent(error.to_string())
    }
}

/// Backoff before attempt `n` (n >= 2): base doubled per prior failure,
/// capped at 30s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2).min(10);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(Duration::from_secs(30))
}

pub fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Data rows in a CSV payload: newline count minus the header line. Counted
/// on raw bytes so the figure is independent of how parsing goes later.
pub fn count_data_rows(raw: &[u8]) -> u64 {
    let mut lines = raw.iter().filter(|&&b| b == b'\n').count() as u64;
    if !raw.is_empty() && !raw.ends_with(b"\n") {
        lines += 1;
    }
    lines.saturating_sub(1)
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, params: &RunParams) -> Result<StagedPartition, IngestError> {
        let url = source_url(params);
        info!(url = url.as_str(), "fetching partition");

        let (compressed, attempts) = self.download(&url).await?;
        let raw = gunzip(&compressed).map_err(|e| IngestError::Fetch {
            url: url.clone(),
            attempts,
            reason: format!("invalid gzip payload: {e}"),
        })?;

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|source| IngestError::Staging {
                path: self.staging_dir.clone(),
                source,
            })?;

        let source_file = format!("{}.csv", params.file_stem());
        let path = self.staging_dir.join(&source_file);
        tokio::fs::write(&path, &raw)
            .await
            .map_err(|source| IngestError::Staging {
                path: path.clone(),
                source,
            })?;

        let raw_rows = count_data_rows(&raw);
        info!(
            url = url.as_str(),
            compressed_bytes = compressed.len() as u64,
            decompressed_bytes = raw.len() as u64,
            raw_rows,
            staged = %path.display(),
            "staged partition"
        );

        Ok(StagedPartition {
            path,
            source_file,
            raw_rows,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
