//! Scraper engine: pooled browser sessions, per-host throttling, retries and in-run dedup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use provsync_adapters::{BrowserDriver, BrowserError, BrowserSession, PageContent};
use provsync_core::{FetchOutcome, ScrapeResult, ScrapeTarget};
use provsync_storage::{BackoffPolicy, HostRateLimiter, RetryDisposition};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

use crate::config::RunConfig;

/// Page markers of bot challenges served with a 200.
pub const CHALLENGE_MARKERS: &[&str] = &[
    "our systems have detected unusual traffic",
    "/sorry/index",
    "<title>just a moment...</title>",
    "cf-browser-verification",
];

pub fn looks_like_challenge(body: &str) -> bool {
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Normalized URL used to dedup fetches: fragment dropped, query pairs sorted,
/// trailing slash trimmed. Scheme and host are lowercased by the parser.
pub fn fingerprint_url(url: &str) -> Result<String, url::ParseError> {
    let mut parsed = Url::parse(url.trim())?;
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }
    Ok(parsed.to_string())
}

/// Per-fetch retry state machine. Terminal states: `Succeeded`, `PermanentFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    InFlight { attempt: u32 },
    TransientFailed { attempt: u32, error: String },
    PermanentFailed {
        attempts: u32,
        error: String,
        /// Retryable failures that ran out of attempts for this cycle.
        exhausted: bool,
    },
    Succeeded { attempts: u32 },
}

impl FetchState {
    /// Starts the next attempt; terminal and in-flight states are unchanged.
    pub fn begin(self) -> FetchState {
        match self {
            FetchState::Pending => FetchState::InFlight { attempt: 1 },
            FetchState::TransientFailed { attempt, .. } => FetchState::InFlight {
                attempt: attempt + 1,
            },
            other => other,
        }
    }

    pub fn succeed(self) -> FetchState {
        match self {
            FetchState::InFlight { attempt } => FetchState::Succeeded { attempts: attempt },
            other => other,
        }
    }

    pub fn fail(self, err: &BrowserError, max_attempts: u32) -> FetchState {
        let FetchState::InFlight { attempt } = self else {
            return self;
        };
        let error = err.to_string();
        match err.disposition() {
            RetryDisposition::Retryable if attempt < max_attempts => {
                FetchState::TransientFailed { attempt, error }
            }
            RetryDisposition::Retryable => FetchState::PermanentFailed {
                attempts: attempt,
                error,
                exhausted: true,
            },
            RetryDisposition::NonRetryable => FetchState::PermanentFailed {
                attempts: attempt,
                error,
                exhausted: false,
            },
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FetchState::Pending => 0,
            FetchState::InFlight { attempt } | FetchState::TransientFailed { attempt, .. } => *attempt,
            FetchState::PermanentFailed { attempts, .. } | FetchState::Succeeded { attempts } => {
                *attempts
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchState::Succeeded { .. } | FetchState::PermanentFailed { .. }
        )
    }

    pub fn outcome(&self) -> FetchOutcome {
        match self {
            FetchState::Succeeded { .. } => FetchOutcome::Success,
            FetchState::PermanentFailed {
                exhausted: false, ..
            } => FetchOutcome::PermanentFailure,
            _ => FetchOutcome::TransientFailure,
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            FetchState::TransientFailed { error, .. } | FetchState::PermanentFailed { error, .. } => {
                Some(error.clone())
            }
            _ => None,
        }
    }
}

/// Bounded pool of reusable browser sessions; at most one user per session.
pub struct SessionPool {
    driver: Arc<dyn BrowserDriver>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
    opened: AtomicUsize,
    discarded: AtomicUsize,
    checked_out: AtomicUsize,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, size: usize) -> Arc<Self> {
        Arc::new(Self {
            driver,
            permits: Arc::new(Semaphore::new(size.max(1))),
            idle: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
        })
    }

    pub async fn checkout(self: &Arc<Self>) -> Result<SessionLease, BrowserError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::Crashed("session pool closed".into()))?;

        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found = None;
            while let Some(session) = idle.pop() {
                if session.is_healthy() {
                    found = Some(session);
                    break;
                }
                self.discarded.fetch_add(1, Ordering::SeqCst);
            }
            found
        };
        let session = match reused {
            Some(session) => session,
            None => {
                let session = self.driver.open_session().await?;
                self.opened.fetch_add(1, Ordering::SeqCst);
                session
            }
        };

        self.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(SessionLease {
            pool: Arc::clone(self),
            session: Some(session),
            broken: false,
            _permit: permit,
        })
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Closes every idle session; used at the end of a run.
    pub async fn close_idle(&self) {
        let sessions: Vec<_> = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.drain(..).collect()
        };
        for mut session in sessions {
            session.close().await;
        }
    }
}

/// A checked-out session. Dropping a lease without `release` discards the session and
/// closes it in the background.
pub struct SessionLease {
    pool: Arc<SessionPool>,
    session: Option<Box<dyn BrowserSession>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        match self.session.as_mut() {
            Some(session) => session.navigate(url).await,
            None => Err(BrowserError::Crashed("lease has no session".into())),
        }
    }

    pub async fn content(&mut self) -> Result<PageContent, BrowserError> {
        match self.session.as_mut() {
            Some(session) => session.content().await,
            None => Err(BrowserError::NoPage),
        }
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Returns a healthy session to the pool, or closes a broken one.
    pub async fn release(mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if self.broken || !session.is_healthy() {
            session.close().await;
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
            debug!("browser session discarded");
            return;
        }
        self.pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => warn!("no runtime to close an abandoned browser session"),
            }
        }
        self.pool.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub per_host_rate_limit: f64,
    pub backoff: BackoffPolicy,
}

impl From<&RunConfig> for EngineConfig {
    fn from(config: &RunConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            per_host_rate_limit: config.per_host_rate_limit,
            backoff: config.backoff(),
        }
    }
}

pub struct ScraperEngine {
    pool: Arc<SessionPool>,
    limiter: HostRateLimiter,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    fetched: Mutex<HashMap<String, Arc<OnceCell<ScrapeResult>>>>,
}

impl ScraperEngine {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool: SessionPool::new(driver, config.max_concurrency),
            limiter: HostRateLimiter::new(config.per_host_rate_limit),
            backoff: config.backoff,
            cancel,
            fetched: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Fetches a target; a fingerprint already fetched in this run shares the earlier result.
    pub async fn fetch(&self, target: &ScrapeTarget) -> ScrapeResult {
        let fingerprint = match fingerprint_url(&target.url) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                let state = FetchState::PermanentFailed {
                    attempts: 0,
                    error: format!("invalid url {}: {err}", target.url),
                    exhausted: false,
                };
                return build_result(target, target.url.clone(), &state, None);
            }
        };

        let cell = self
            .fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint.clone())
            .or_default()
            .clone();
        let shared = cell
            .get_or_init(|| self.fetch_uncached(target, fingerprint))
            .await;

        let mut result = shared.clone();
        result.target_id = target.target_id.clone();
        result.provider_id = target.provider_id.clone();
        result
    }

    /// Fetches concurrently; results come back in completion order.
    pub async fn fetch_batch(self: &Arc<Self>, targets: Vec<ScrapeTarget>) -> Vec<ScrapeResult> {
        let mut set = JoinSet::new();
        for target in targets {
            let engine = Arc::clone(self);
            set.spawn(async move { engine.fetch(&target).await });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "fetch task did not complete"),
            }
        }
        results
    }

    async fn fetch_uncached(&self, target: &ScrapeTarget, fingerprint: String) -> ScrapeResult {
        let host = Url::parse(&target.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut state = FetchState::Pending;

        loop {
            state = state.begin();
            let attempt = state.attempts();
            let span = info_span!(
                "scrape_fetch",
                target_id = %target.target_id,
                host = %host,
                attempt
            );
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.attempt(&target.url, &host).instrument(span) => Some(result),
            };

            match outcome {
                None => return cancelled_result(target, fingerprint, attempt),
                Some(Ok(page)) => {
                    state = state.succeed();
                    debug!(target_id = %target.target_id, host, attempt, "fetch succeeded");
                    return build_result(target, fingerprint, &state, Some(page));
                }
                Some(Err(err)) => {
                    state = state.fail(&err, max_attempts);
                    if state.is_terminal() {
                        warn!(
                            target_id = %target.target_id,
                            host,
                            attempts = state.attempts(),
                            error = %err,
                            "fetch failed"
                        );
                        return build_result(target, fingerprint, &state, None);
                    }
                    let delay = self.backoff.sample_delay(attempt - 1);
                    debug!(target_id = %target.target_id, host, attempt, ?delay, error = %err, "retrying fetch");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return cancelled_result(target, fingerprint, attempt);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt(&self, url: &str, host: &str) -> Result<PageContent, BrowserError> {
        self.limiter.acquire(host).await;
        let mut lease = self.pool.checkout().await?;

        let loaded = match lease.navigate(url).await {
            Ok(()) => lease.content().await,
            Err(err) => Err(err),
        };
        let result = match loaded {
            Ok(page) if looks_like_challenge(&page.body) => {
                Err(BrowserError::Challenge(host.to_string()))
            }
            other => other,
        };
        if let Err(err) = &result {
            if err.breaks_session() {
                lease.mark_broken();
            }
        }
        lease.release().await;
        result
    }
}

fn build_result(
    target: &ScrapeTarget,
    fingerprint: String,
    state: &FetchState,
    page: Option<PageContent>,
) -> ScrapeResult {
    let (url, content, content_type) = match page {
        Some(page) => (page.final_url, page.body, page.content_type),
        None => (target.url.clone(), String::new(), None),
    };
    ScrapeResult {
        target_id: target.target_id.clone(),
        provider_id: target.provider_id.clone(),
        url,
        fingerprint,
        content,
        content_type,
        outcome: state.outcome(),
        attempts: state.attempts(),
        error: state.error(),
        retrieved_at: Utc::now(),
    }
}

fn cancelled_result(target: &ScrapeTarget, fingerprint: String, attempt: u32) -> ScrapeResult {
    let state = FetchState::TransientFailed {
        attempt,
        error: "fetch cancelled".to_string(),
    };
    build_result(target, fingerprint, &state, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_query_order_fragment_and_trailing_slash() {
        let a = fingerprint_url("https://WWW.AIA.com.my/en/plans/?b=2&a=1#top").unwrap();
        let b = fingerprint_url("https://www.aia.com.my/en/plans?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "https://www.aia.com.my/en/plans?a=1&b=2");
        assert_ne!(a, fingerprint_url("https://www.aia.com.my/en/plans?a=1&b=3").unwrap());
        assert!(fingerprint_url("not a url").is_err());
    }

    #[test]
    fn retry_state_machine_downgrades_after_last_attempt() {
        let timeout = BrowserError::Timeout("u".into());
        let state = FetchState::Pending.begin();
        assert_eq!(state, FetchState::InFlight { attempt: 1 });

        let state = state.fail(&timeout, 2);
        assert!(matches!(state, FetchState::TransientFailed { attempt: 1, .. }));
        assert!(!state.is_terminal());

        let state = state.begin().fail(&timeout, 2);
        assert!(state.is_terminal());
        assert_eq!(state.attempts(), 2);
        assert_eq!(state.outcome(), FetchOutcome::TransientFailure);

        let gone = BrowserError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        let state = FetchState::Pending.begin().fail(&gone, 5);
        assert_eq!(state.outcome(), FetchOutcome::PermanentFailure);
        assert_eq!(state.attempts(), 1);

        let done = FetchState::Pending.begin().succeed();
        assert_eq!(done, FetchState::Succeeded { attempts: 1 });
        assert_eq!(done.clone().begin(), done);
    }

    #[test]
    fn challenge_pages_are_detected() {
        assert!(looks_like_challenge(
            "<html><body>Our systems have detected unusual traffic from your computer network.</body></html>"
        ));
        assert!(!looks_like_challenge("<html><body><h1>Klinik A</h1></body></html>"));
    }
}
