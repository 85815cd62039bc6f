//! Artifact retention, retry policy, rate limiting and durable record storage for provsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use provsync_core::ScrapeResult;
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod ratelimit;
pub mod records;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;
pub use ratelimit::{HostRateLimiter, TokenBucket};
pub use records::{EnrichmentCandidate, RecordOp, RecordStore, SnapshotState, StoreError};

pub const CRATE_NAME: &str = "provsync-storage";

/// Where a scrape that failed extraction was kept.
#[derive(Debug, Clone)]
pub struct RetainedScrape {
    /// Digest of the reason, URL and content, so repeated failures land in one file.
    pub digest: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub already_retained: bool,
}

/// Write-once diagnostics area for scrapes an operator should look at.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

#[derive(Debug, Serialize)]
struct DiagnosticEnvelope<'a> {
    reason: &'a str,
    retained_at: DateTime<Utc>,
    scrape: &'a ScrapeResult,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `diagnostics/<day>/<provider>/<target>-<digest prefix>.json`
    pub fn diagnostic_path(&self, scrape: &ScrapeResult, digest: &str) -> PathBuf {
        let target: String = scrape
            .target_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let short = &digest[..digest.len().min(16)];
        PathBuf::from("diagnostics")
            .join(scrape.retrieved_at.format("%Y%m%d").to_string())
            .join(&scrape.provider_id)
            .join(format!("{target}-{short}.json"))
    }

    /// Keep a scrape whose extraction failed so an operator can inspect it later.
    pub async fn retain_scrape_result(
        &self,
        scrape: &ScrapeResult,
        reason: &str,
    ) -> anyhow::Result<RetainedScrape> {
        let digest = Self::sha256_hex(format!("{reason}\n{}\n{}", scrape.url, scrape.content).as_bytes());
        let relative_path = self.diagnostic_path(scrape, &digest);
        let absolute_path = self.root.join(&relative_path);
        let envelope = DiagnosticEnvelope {
            reason,
            retained_at: Utc::now(),
            scrape,
        };
        let body = serde_json::to_vec_pretty(&envelope).context("serializing diagnostic scrape")?;
        let created = write_once(&absolute_path, &body).await?;
        Ok(RetainedScrape {
            digest,
            relative_path,
            absolute_path,
            already_retained: !created,
        })
    }
}

/// Publishes `body` at `path` unless a file is already there. Returns whether it wrote.
///
/// The body is staged next to the target and hard-linked into place, which fails
/// instead of overwriting when another writer got there first.
async fn write_once(path: &Path, body: &[u8]) -> anyhow::Result<bool> {
    let dir = path.parent().context("diagnostic path has no parent directory")?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating diagnostics directory {}", dir.display()))?;

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&staging, body)
        .await
        .with_context(|| format!("staging {}", staging.display()))?;
    let published = fs::hard_link(&staging, path).await;
    if let Err(err) = fs::remove_file(&staging).await {
        tracing::debug!(path = %staging.display(), error = %err, "staging file left behind");
    }

    match published {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publishing {}", path.display())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 408, 429 and 5xx are worth another attempt; everything else (404, 410, 403, ...) is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts allowed per fetch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay that is randomized, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `unit` in `0.0..=1.0` picks a point in `[delay * (1 - jitter), delay]`.
    pub fn delay_with_jitter(&self, attempt_index: u32, unit: f64) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let scale = 1.0 - jitter * (1.0 - unit.clamp(0.0, 1.0));
        delay.mul_f64(scale)
    }

    pub fn sample_delay(&self, attempt_index: u32) -> Duration {
        let unit = rand::rng().random_range(0.0..=1.0);
        self.delay_with_jitter(attempt_index, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use provsync_core::FetchOutcome;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    fn brochure_scrape(target_id: &str) -> ScrapeResult {
        ScrapeResult {
            target_id: target_id.into(),
            provider_id: "etiqa".into(),
            url: "https://www.etiqa.com.my/medical".into(),
            fingerprint: "https://www.etiqa.com.my/medical".into(),
            content: "<html>brochure</html>".into(),
            content_type: Some("text/html".into()),
            outcome: FetchOutcome::Success,
            attempts: 1,
            error: None,
            retrieved_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn failed_scrapes_are_retained_as_json() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let scrape = brochure_scrape("plan-1");

        let stored = store
            .retain_scrape_result(&scrape, "annual_limit: not a number")
            .await
            .expect("retain");
        let body = std::fs::read_to_string(&stored.absolute_path).expect("read back");
        let json: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(json["reason"], "annual_limit: not a number");
        assert_eq!(json["scrape"]["target_id"], "plan-1");
        assert!(!stored.already_retained);
        assert!(stored
            .relative_path
            .starts_with(PathBuf::from("diagnostics").join("20260302").join("etiqa")));
        let name = stored.relative_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("plan-1-"), "{name}");
        assert!(name.ends_with(".json"), "{name}");
    }

    #[tokio::test]
    async fn repeated_failures_are_kept_once_and_new_reasons_get_their_own_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let scrape = brochure_scrape("plan/7");

        let first = store.retain_scrape_result(&scrape, "missing name").await.expect("first");
        let again = store.retain_scrape_result(&scrape, "missing name").await.expect("again");
        let other = store.retain_scrape_result(&scrape, "bad percentage").await.expect("other");

        assert!(!first.already_retained);
        assert!(again.already_retained);
        assert_eq!(first.relative_path, again.relative_path);
        assert_ne!(first.relative_path, other.relative_path);
        assert!(!other.already_retained);
        assert!(first.relative_path.to_string_lossy().contains("plan_7-"));

        let day_dir = dir.path().join("diagnostics").join("20260302").join("etiqa");
        let mut names: Vec<String> = std::fs::read_dir(&day_dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2, "{names:?}");
        assert!(names.iter().all(|name| !name.ends_with(".partial")));
    }

    #[test]
    fn retry_classification_separates_transient_and_permanent() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::GONE), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(policy.sample_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            base_delay: Duration::from_millis(400),
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_with_jitter(0, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay_with_jitter(0, 1.0), Duration::from_millis(400));
        for _ in 0..50 {
            let d = policy.sample_delay(0);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }
}
