#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use provsync_adapters::{
    AdapterError, BrowserDriver, BrowserError, BrowserSession, DeepOutput, DocumentModel,
    DocumentModelError, PageContent, SourceOfTruth,
};
use provsync_core::{
    deterministic_id, EnrichmentTarget, ExtractionSchema, FetchOutcome, FieldValue, RecordKind,
    Row, ScrapeResult, ScrapeTarget,
};
use provsync_storage::MemoryRecordStore;
use provsync_sync::RunConfig;
use serde_json::{Map, Value};
use tokio::time::Instant;

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

pub fn fixture(provider_id: &str, name: &str) -> String {
    let path = workspace_root()
        .join("fixtures")
        .join(provider_id)
        .join("sample")
        .join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Config with fast retries and no throttling unless a test opts in.
pub fn test_config(artifacts: &Path) -> RunConfig {
    RunConfig {
        per_host_rate_limit: 0.0,
        artifacts_dir: artifacts.to_path_buf(),
        workspace_root: artifacts.to_path_buf(),
        ..RunConfig::default()
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Page(String),
    Fail(BrowserError),
}

#[derive(Default)]
struct BrowserState {
    routes: Mutex<Vec<(String, VecDeque<Step>)>>,
    latency: Mutex<Duration>,
    navigations: Mutex<Vec<(String, Instant)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Browser whose pages are scripted per URL substring. Each navigation consumes the
/// next step of the first matching route; the last step repeats. Unrouted URLs 404.
#[derive(Clone, Default)]
pub struct ScriptedBrowser {
    state: Arc<BrowserState>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, pattern: &str, steps: Vec<Step>) -> Self {
        self.state
            .routes
            .lock()
            .unwrap()
            .push((pattern.to_string(), steps.into_iter().collect()));
        self
    }

    pub fn page(self, pattern: &str, body: &str) -> Self {
        self.route(pattern, vec![Step::Page(body.to_string())])
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    pub fn navigations(&self) -> Vec<(String, Instant)> {
        self.state.navigations.lock().unwrap().clone()
    }

    pub fn navigations_to(&self, pattern: &str) -> Vec<Instant> {
        self.navigations()
            .into_iter()
            .filter(|(url, _)| url.contains(pattern))
            .map(|(_, at)| at)
            .collect()
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        Arc::new(self.clone())
    }

    fn next_step(&self, url: &str) -> Option<Step> {
        let mut routes = self.state.routes.lock().unwrap();
        let (_, steps) = routes.iter_mut().find(|(pattern, _)| url.contains(pattern.as_str()))?;
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            browser: self.clone(),
            page: None,
            healthy: true,
        }))
    }
}

struct ActiveGuard(Arc<BrowserState>);

impl ActiveGuard {
    fn enter(state: &Arc<BrowserState>) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedSession {
    browser: ScriptedBrowser,
    page: Option<PageContent>,
    healthy: bool,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let state = self.browser.state.clone();
        state
            .navigations
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        let _active = ActiveGuard::enter(&state);
        let latency = *state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.page = None;
        match self.browser.next_step(url) {
            Some(Step::Page(body)) => {
                self.page = Some(PageContent {
                    final_url: url.to_string(),
                    content_type: Some("text/html".to_string()),
                    body,
                });
                Ok(())
            }
            Some(Step::Fail(err)) => {
                if err.breaks_session() {
                    self.healthy = false;
                }
                Err(err)
            }
            None => Err(BrowserError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }

    async fn content(&mut self) -> Result<PageContent, BrowserError> {
        self.page.clone().ok_or(BrowserError::NoPage)
    }

    async fn close(&mut self) {
        if self.healthy {
            self.browser.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.healthy = false;
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Document model answering every call with the same scripted result.
pub struct ScriptedModel {
    answer: Result<DeepOutput, DocumentModelError>,
    calls: AtomicUsize,
    latency: Duration,
    documents: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn answering(fields: Value, cost_units: f64) -> Arc<Self> {
        Self::answering_after(fields, cost_units, Duration::ZERO)
    }

    /// Like `answering`, but each call takes `latency` to return.
    pub fn answering_after(fields: Value, cost_units: f64, latency: Duration) -> Arc<Self> {
        let fields: Map<String, Value> = match fields {
            Value::Object(map) => map,
            other => panic!("model answer must be an object, got {other}"),
        };
        let answer = Ok(DeepOutput {
            fields,
            confidences: BTreeMap::new(),
            cost_units,
        });
        Self::scripted(answer, latency)
    }

    pub fn failing(err: DocumentModelError) -> Arc<Self> {
        Self::scripted(Err(err), Duration::ZERO)
    }

    fn scripted(answer: Result<DeepOutput, DocumentModelError>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
            latency,
            documents: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Documents the model was asked to read, in call order.
    pub fn documents(&self) -> Vec<String> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentModel for ScriptedModel {
    async fn extract(
        &self,
        document: &str,
        _schema: &ExtractionSchema,
        _context: &BTreeMap<String, String>,
    ) -> Result<DeepOutput, DocumentModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.documents.lock().unwrap().push(document.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.answer.clone()
    }
}

/// In-memory source of truth with a settable fingerprint.
pub struct FixedSource {
    source_id: String,
    kind: RecordKind,
    rows: Mutex<Vec<Row>>,
    fingerprint: Mutex<String>,
    exports: AtomicUsize,
    unreachable: AtomicBool,
}

impl FixedSource {
    pub fn clinics(rows: Vec<Row>, fingerprint: &str) -> Self {
        Self {
            source_id: "clinic-sheet".to_string(),
            kind: RecordKind::Clinic,
            rows: Mutex::new(rows),
            fingerprint: Mutex::new(fingerprint.to_string()),
            exports: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn replace(&self, rows: Vec<Row>, fingerprint: &str) {
        *self.rows.lock().unwrap() = rows;
        *self.fingerprint.lock().unwrap() = fingerprint.to_string();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AdapterError::SourceUnreachable {
                source_id: self.source_id.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceOfTruth for FixedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn record_kind(&self) -> RecordKind {
        self.kind
    }

    async fn current_fingerprint(&self) -> Result<String, AdapterError> {
        self.check()?;
        Ok(self.fingerprint.lock().unwrap().clone())
    }

    async fn export_rows(&self) -> Result<Vec<Row>, AdapterError> {
        self.check()?;
        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().unwrap().clone())
    }
}

pub fn clinic_row(name: &str, address: &str, city: &str) -> Row {
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), FieldValue::text(name));
    fields.insert("address".to_string(), FieldValue::text(address));
    fields.insert("city".to_string(), FieldValue::text(city));
    fields.insert("state".to_string(), FieldValue::text("Selangor"));
    fields.insert("facility_type".to_string(), FieldValue::text("KLINIK AM"));
    Row {
        external_id: deterministic_id(&[name, address]),
        fields,
    }
}

/// A map listing page for `name` that carries coordinates and nothing else.
pub fn maps_page_with_coordinates(name: &str, lat: f64, lng: f64) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<title>{name} - Google Maps</title>
<link rel="canonical" href="https://www.google.com/maps/place/{slug}/@{lat},{lng},17z">
</head>
<body>
<div role="main" aria-label="{name}">
  <h1 class="DUwDvf">{name}</h1>
</div>
</body>
</html>"#,
        slug = name.replace(' ', "+"),
    )
}

pub fn scrape_target(id: &str, url: &str) -> ScrapeTarget {
    ScrapeTarget {
        target_id: id.to_string(),
        provider_id: "google-maps".to_string(),
        url: url.to_string(),
    }
}

pub fn plan_target(plan_name: &str, detail_url: &str) -> EnrichmentTarget {
    let mut context = BTreeMap::new();
    context.insert("plan_name".to_string(), plan_name.to_string());
    context.insert("provider_name".to_string(), "AIA Malaysia".to_string());
    context.insert("detail_url".to_string(), detail_url.to_string());
    EnrichmentTarget {
        external_id: deterministic_id(&["aia", plan_name]),
        record_kind: RecordKind::InsurancePlan,
        provider_id: "aia".to_string(),
        missing_fields: vec!["annual_limit".to_string()],
        context,
        last_attempt_at: None,
        consecutive_failures: 0,
    }
}

pub fn page_scrape(target: &EnrichmentTarget, url: &str, content: &str) -> ScrapeResult {
    ScrapeResult {
        target_id: target.external_id.clone(),
        provider_id: target.provider_id.clone(),
        url: url.to_string(),
        fingerprint: url.to_string(),
        content: content.to_string(),
        content_type: Some("text/html".to_string()),
        outcome: FetchOutcome::Success,
        attempts: 1,
        error: None,
        retrieved_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
    }
}

pub fn memory_store() -> Arc<MemoryRecordStore> {
    Arc::new(MemoryRecordStore::new())
}
