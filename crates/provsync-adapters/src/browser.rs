//! Browser-automation capability consumed by the scraper engine.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use provsync_storage::{classify_reqwest_error, classify_status, RetryDisposition};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("timed out loading {0}")]
    Timeout(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("session crashed: {0}")]
    Crashed(String),
    #[error("bot challenge served by {0}")]
    Challenge(String),
    #[error("no page loaded in session")]
    NoPage,
    #[error("unreadable document at {url}: {message}")]
    Unreadable { url: String, message: String },
}

impl BrowserError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            BrowserError::Timeout(_) | BrowserError::Crashed(_) | BrowserError::Challenge(_) => {
                RetryDisposition::Retryable
            }
            BrowserError::Navigation { retryable, .. } => {
                if *retryable {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::NonRetryable
                }
            }
            BrowserError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            BrowserError::NoPage | BrowserError::Unreadable { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// Whether the session that raised this error must be discarded.
    pub fn breaks_session(&self) -> bool {
        matches!(self, BrowserError::Crashed(_))
    }
}

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

fn is_pdf(content_type: Option<&str>, url: &str) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().starts_with(PDF_CONTENT_TYPE))
        || url
            .split(['?', '#'])
            .next()
            .is_some_and(|path| path.to_ascii_lowercase().ends_with(".pdf"))
}

/// Text layer of a PDF. Parsing runs on the blocking pool; a parser panic is
/// reported as an unreadable document.
pub async fn pdf_text(url: &str, bytes: Vec<u8>) -> Result<String, BrowserError> {
    let unreadable = |message: String| BrowserError::Unreadable {
        url: url.to_string(),
        message,
    };
    let parsed = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| unreadable(format!("pdf parser aborted: {e}")))?;
    let text = parsed.map_err(|e| unreadable(e.to_string()))?;
    if text.trim().is_empty() {
        return Err(unreadable("pdf has no text layer".to_string()));
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn content(&mut self) -> Result<PageContent, BrowserError>;

    async fn close(&mut self);

    /// False once the session is unusable (crashed renderer, closed).
    fn is_healthy(&self) -> bool;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[derive(Debug, Clone)]
pub struct HttpBrowserConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpBrowserConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Plain HTTP driver: every session shares one connection pool.
#[derive(Debug, Clone)]
pub struct HttpBrowser {
    client: reqwest::Client,
}

impl HttpBrowser {
    pub fn new(config: HttpBrowserConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BrowserDriver for HttpBrowser {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            page: None,
            open: true,
        }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    page: Option<PageContent>,
    open: bool,
}

fn request_error(url: &str, err: reqwest::Error) -> BrowserError {
    if err.is_timeout() {
        return BrowserError::Timeout(url.to_string());
    }
    BrowserError::Navigation {
        url: url.to_string(),
        retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
        message: err.to_string(),
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        if !self.open {
            return Err(BrowserError::Crashed("session already closed".into()));
        }
        self.page = None;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(BrowserError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = if is_pdf(content_type.as_deref(), &final_url) {
            let bytes = resp.bytes().await.map_err(|e| request_error(url, e))?;
            debug!(url, bytes = bytes.len(), "pdf downloaded");
            pdf_text(&final_url, bytes.to_vec()).await?
        } else {
            resp.text().await.map_err(|e| request_error(url, e))?
        };
        debug!(url, bytes = body.len(), "page loaded");

        self.page = Some(PageContent {
            final_url,
            content_type,
            body,
        });
        Ok(())
    }

    async fn content(&mut self) -> Result<PageContent, BrowserError> {
        self.page.clone().ok_or(BrowserError::NoPage)
    }

    async fn close(&mut self) {
        self.open = false;
        self.page = None;
    }

    fn is_healthy(&self) -> bool {
        self.open
    }
}
