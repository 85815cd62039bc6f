//! Run configuration and the provider registry file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use provsync_adapters::{ProviderEntry, ProviderRegistry};
use provsync_storage::BackoffPolicy;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    /// Requests per second per host; non-positive disables throttling.
    pub per_host_rate_limit: f64,
    /// Total fetch attempts per target, first try included.
    pub retry_limit: u32,
    pub cost_ceiling: f64,
    pub confidence_threshold: f64,
    pub deep_estimate: f64,
    pub min_billable: f64,
    pub failure_penalty_after: u32,
    pub failure_penalty: chrono::Duration,
    pub run_deadline: Duration,
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub workspace_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_concurrency: 4,
            per_host_rate_limit: 1.0,
            retry_limit: 3,
            cost_ceiling: 100.0,
            confidence_threshold: 0.8,
            deep_estimate: 2.0,
            min_billable: 0.5,
            failure_penalty_after: 3,
            failure_penalty: chrono::Duration::hours(24),
            run_deadline: Duration::from_secs(7200),
            database_url: None,
            artifacts_dir: PathBuf::from("./artifacts"),
            user_agent: "provsync-bot/0.1".to_string(),
            http_timeout_secs: 20,
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_batch_size: env_or("PROVSYNC_MAX_BATCH_SIZE", defaults.max_batch_size),
            max_concurrency: env_or("PROVSYNC_MAX_CONCURRENCY", defaults.max_concurrency),
            per_host_rate_limit: env_or("PROVSYNC_PER_HOST_RATE_LIMIT", defaults.per_host_rate_limit),
            retry_limit: env_or("PROVSYNC_RETRY_LIMIT", defaults.retry_limit),
            cost_ceiling: env_or("PROVSYNC_COST_CEILING", defaults.cost_ceiling),
            confidence_threshold: env_or(
                "PROVSYNC_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            deep_estimate: env_or("PROVSYNC_DEEP_ESTIMATE", defaults.deep_estimate),
            min_billable: env_or("PROVSYNC_MIN_BILLABLE", defaults.min_billable),
            failure_penalty_after: env_or(
                "PROVSYNC_FAILURE_PENALTY_AFTER",
                defaults.failure_penalty_after,
            ),
            failure_penalty: chrono::Duration::hours(env_or("PROVSYNC_FAILURE_PENALTY_HOURS", 24)),
            run_deadline: Duration::from_secs(env_or("PROVSYNC_RUN_DEADLINE_SECS", 7200)),
            database_url: env_opt("DATABASE_URL"),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            user_agent: std::env::var("PROVSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("PROVSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            workspace_root: std::env::var("PROVSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
        .normalized()
    }

    /// Zero limits become 1; the threshold is kept within 0..=1.
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = self.max_batch_size.max(1);
        self.max_concurrency = self.max_concurrency.max(1);
        self.retry_limit = self.retry_limit.max(1);
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.cost_ceiling = self.cost_ceiling.max(0.0);
        self.deep_estimate = self.deep_estimate.max(0.0);
        self.min_billable = self.min_billable.max(0.0);
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry_limit,
            ..BackoffPolicy::default()
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersFile {
    providers: Vec<ProviderEntry>,
}

pub fn parse_provider_entries(text: &str) -> Result<Vec<ProviderEntry>> {
    let file: ProvidersFile = serde_yaml::from_str(text).context("parsing providers.yaml")?;
    Ok(file.providers)
}

/// Registry from `<root>/providers.yaml`, or every built-in provider when the file is absent.
pub async fn load_provider_registry(workspace_root: &Path) -> Result<ProviderRegistry> {
    let path = workspace_root.join("providers.yaml");
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!(path = %path.display(), "no providers.yaml, using built-in providers");
        return Ok(ProviderRegistry::builtin());
    }
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let entries = parse_provider_entries(&text)?;
    ProviderRegistry::from_entries(&entries).with_context(|| format!("loading {}", path.display()))
}
