//! External capabilities driven by the pipeline: browsers, provider scrapers,
//! source-of-truth exports and the document-understanding model.

use std::collections::BTreeMap;
use std::sync::Arc;

use provsync_core::{EnrichmentTarget, ExtractedField, ExtractionSchema, RecordKind, ScrapeResult};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod browser;
pub mod document;
pub mod insurance;
pub mod maps;
pub mod schema;
pub mod sheet;

pub use browser::{
    BrowserDriver, BrowserError, BrowserSession, HttpBrowser, HttpBrowserConfig, PageContent,
};
pub use document::{
    estimate_call_units, prepare_document, DeepOutput, DocumentModel, DocumentModelError,
    OpenAiDocumentModel,
};
pub use insurance::{is_medical_plan, InsuranceProfile, InsuranceSiteScraper, PlanLead};
pub use maps::MapsListingScraper;
pub use sheet::{ClinicSheetExport, HttpSheetExport, SourceOfTruth};

pub const CRATE_NAME: &str = "provsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    #[error("source {source_id} unreachable: {message}")]
    SourceUnreachable { source_id: String, message: String },
    #[error("malformed export from {source_id}: {message}")]
    MalformedExport { source_id: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Deterministic parse of a known-shape page (the fast tier).
pub trait ListingScraper: Send + Sync {
    /// Page to fetch for a target, or `None` when the target lacks the data to build one.
    fn target_url(&self, target: &EnrichmentTarget) -> Option<String>;

    /// Whether `content` has the structure this scraper knows how to read.
    fn recognizes(&self, content: &str) -> bool;

    fn parse(
        &self,
        scrape: &ScrapeResult,
        target: &EnrichmentTarget,
    ) -> Result<BTreeMap<String, ExtractedField>, AdapterError>;

    /// Plan leads found on a provider listing page.
    fn discover(&self, _content: &str) -> Result<Vec<PlanLead>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Unstructured-document handling for the deep tier.
pub trait DocumentScraper: Send + Sync {
    /// Fields the document model is asked for.
    fn schema(&self) -> &ExtractionSchema;

    fn document_text(&self, content: &str) -> String {
        html_to_text(content)
    }

    /// A richer document linked from the page (a product brochure) to read instead of it.
    fn brochure_url(&self, _content: &str, _page_url: &str) -> Option<String> {
        None
    }
}

/// Capability pair for one provider; either half may be absent.
#[derive(Clone)]
pub struct ProviderAdapter {
    pub provider_id: String,
    pub display_name: String,
    pub record_kind: RecordKind,
    pub listing_urls: Vec<String>,
    pub listing: Option<Arc<dyn ListingScraper>>,
    pub document: Option<Arc<dyn DocumentScraper>>,
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider_id", &self.provider_id)
            .field("record_kind", &self.record_kind)
            .field("listing", &self.listing.is_some())
            .field("document", &self.document.is_some())
            .finish()
    }
}

pub fn adapter_for_provider(provider_id: &str) -> Option<ProviderAdapter> {
    match provider_id {
        maps::PROVIDER_ID => Some(ProviderAdapter {
            provider_id: maps::PROVIDER_ID.to_string(),
            display_name: "Google Maps".to_string(),
            record_kind: RecordKind::Clinic,
            listing_urls: Vec::new(),
            listing: Some(Arc::new(MapsListingScraper::default())),
            document: None,
        }),
        id => insurance::profile(id).map(|profile| {
            let scraper = Arc::new(InsuranceSiteScraper::new(profile));
            ProviderAdapter {
                provider_id: profile.provider_id.to_string(),
                display_name: profile.name.to_string(),
                record_kind: RecordKind::InsurancePlan,
                listing_urls: vec![profile.products_url.to_string()],
                listing: Some(scraper.clone()),
                document: Some(scraper),
            }
        }),
    }
}

/// One `providers.yaml` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: RecordKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, ProviderAdapter>,
}

impl ProviderRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for id in std::iter::once(maps::PROVIDER_ID).chain(insurance::PROVIDER_IDS.iter().copied()) {
            if let Some(adapter) = adapter_for_provider(id) {
                registry.insert(adapter);
            }
        }
        registry
    }

    /// Enabled entries only; listing URLs from the entry override the built-in defaults.
    pub fn from_entries(entries: &[ProviderEntry]) -> Result<Self, AdapterError> {
        let mut registry = Self::default();
        for entry in entries.iter().filter(|e| e.enabled) {
            let mut adapter = adapter_for_provider(&entry.provider_id)
                .ok_or_else(|| AdapterError::UnknownProvider(entry.provider_id.clone()))?;
            if adapter.record_kind != entry.kind {
                return Err(AdapterError::Message(format!(
                    "provider {} is a {} provider, configured as {}",
                    entry.provider_id, adapter.record_kind, entry.kind
                )));
            }
            adapter.display_name = entry.display_name.clone();
            if !entry.listing_urls.is_empty() {
                adapter.listing_urls = entry.listing_urls.clone();
            }
            registry.insert(adapter);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: ProviderAdapter) {
        self.adapters.insert(adapter.provider_id.clone(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderAdapter> {
        self.adapters.get(provider_id)
    }

    pub fn of_kind(&self, kind: RecordKind) -> impl Iterator<Item = &ProviderAdapter> {
        self.adapters.values().filter(move |a| a.record_kind == kind)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(format!("{selector}: {e}")))
}

pub(crate) fn select_first_text(
    document: &Html,
    selector: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .find_map(|n| text_or_none(n.text().collect::<String>())))
}

pub(crate) fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

pub(crate) fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string())))
}

pub fn looks_like_html(content: &str) -> bool {
    let head = content
        .trim_start()
        .chars()
        .take(512)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<body")
}

/// Visible text of an HTML page, whitespace-collapsed; non-HTML input is returned trimmed.
pub fn html_to_text(content: &str) -> String {
    if !looks_like_html(content) {
        return content.trim().to_string();
    }
    let document = Html::parse_document(content);
    let root = document.root_element();
    let mut out = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(ElementRef::wrap)
            .map(|el| matches!(el.value().name(), "script" | "style" | "noscript" | "template"))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if let Some(t) = text_or_none(text.to_string()) {
            out.push(t);
        }
    }
    out.join(" ")
}
