//! Clinic sheet export: the source of truth for clinic rows.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use provsync_core::{deterministic_id, FieldValue, RecordKind, Row};
use provsync_storage::ArtifactStore;
use reqwest::header::{ETAG, LAST_MODIFIED};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AdapterError;

/// Title row plus header row precede the data.
pub const SKIP_ROWS: usize = 2;

const COLUMNS: &[(&str, &str)] = &[
    ("JENIS_FASILITI", "facility_type"),
    ("NAMA_PENUH_FASILITI", "name"),
    ("ALAMAT", "address"),
    ("POSKOD", "postcode"),
    ("BANDAR", "city"),
    ("NEGERI", "state"),
];

#[async_trait]
pub trait SourceOfTruth: Send + Sync {
    fn source_id(&self) -> &str;

    fn record_kind(&self) -> RecordKind;

    /// Cheap identity of the current export; equal fingerprints mean equal content.
    async fn current_fingerprint(&self) -> Result<String, AdapterError>;

    async fn export_rows(&self) -> Result<Vec<Row>, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct ValuesGrid {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Rows of a values-grid export keyed by the deterministic clinic id.
pub fn parse_sheet_values(source_id: &str, content: &str) -> Result<Vec<Row>, AdapterError> {
    let malformed = |message: String| AdapterError::MalformedExport {
        source_id: source_id.to_string(),
        message,
    };
    let grid: ValuesGrid =
        serde_json::from_str(content).map_err(|e| malformed(format!("invalid json: {e}")))?;
    if grid.values.len() < SKIP_ROWS {
        return Err(malformed(format!(
            "expected a title and header row, got {} rows",
            grid.values.len()
        )));
    }

    let header = &grid.values[SKIP_ROWS - 1];
    let index_of = |column: &str| {
        header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(column))
    };
    let mut columns = Vec::with_capacity(COLUMNS.len());
    for (column, field) in COLUMNS {
        let idx = index_of(column).ok_or_else(|| malformed(format!("missing column {column}")))?;
        columns.push((idx, *field));
    }

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (line, cells) in grid.values.iter().enumerate().skip(SKIP_ROWS) {
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let cell = |idx: usize| cells.get(idx).map(|c| c.trim()).unwrap_or_default();

        let mut fields = BTreeMap::new();
        for (idx, field) in &columns {
            let value = cell(*idx);
            let value = if value.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::text(value)
            };
            fields.insert(field.to_string(), value);
        }

        let Some(name) = fields.get("name").and_then(FieldValue::as_text).map(str::to_string) else {
            debug!(source_id, line, "row without facility name skipped");
            continue;
        };
        let address = fields
            .get("address")
            .and_then(FieldValue::as_text)
            .unwrap_or_default()
            .to_string();
        let upper = name.to_uppercase();
        fields.insert(
            "is_24_hours".to_string(),
            FieldValue::Bool(upper.contains("24 JAM") || upper.contains("24JAM")),
        );

        let external_id = deterministic_id(&[&name, &address]);
        if !seen.insert(external_id.clone()) {
            warn!(source_id, line, name = %name, "duplicate clinic row ignored");
            continue;
        }
        rows.push(Row { external_id, fields });
    }
    Ok(rows)
}

/// Export saved to disk (the scheduled download lands here).
#[derive(Debug, Clone)]
pub struct ClinicSheetExport {
    source_id: String,
    path: PathBuf,
}

impl ClinicSheetExport {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    async fn read(&self) -> Result<String, AdapterError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AdapterError::SourceUnreachable {
                source_id: self.source_id.clone(),
                message: format!("{}: {e}", self.path.display()),
            })
    }
}

#[async_trait]
impl SourceOfTruth for ClinicSheetExport {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn record_kind(&self) -> RecordKind {
        RecordKind::Clinic
    }

    async fn current_fingerprint(&self) -> Result<String, AdapterError> {
        let content = self.read().await?;
        Ok(ArtifactStore::sha256_hex(content.as_bytes()))
    }

    async fn export_rows(&self) -> Result<Vec<Row>, AdapterError> {
        let content = self.read().await?;
        parse_sheet_values(&self.source_id, &content)
    }
}

/// Export served over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSheetExport {
    source_id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpSheetExport {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            source_id: source_id.into(),
            url: url.into(),
            client,
        })
    }

    fn unreachable(&self, message: impl std::fmt::Display) -> AdapterError {
        AdapterError::SourceUnreachable {
            source_id: self.source_id.clone(),
            message: format!("{}: {message}", self.url),
        }
    }

    async fn download(&self) -> Result<String, AdapterError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !resp.status().is_success() {
            return Err(self.unreachable(format!("status {}", resp.status())));
        }
        resp.text().await.map_err(|e| self.unreachable(e))
    }
}

#[async_trait]
impl SourceOfTruth for HttpSheetExport {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn record_kind(&self) -> RecordKind {
        RecordKind::Clinic
    }

    async fn current_fingerprint(&self) -> Result<String, AdapterError> {
        if let Ok(resp) = self.client.head(&self.url).send().await {
            if resp.status().is_success() {
                let headers = resp.headers();
                let validator = headers
                    .get(ETAG)
                    .map(|v| ("etag", v))
                    .or_else(|| headers.get(LAST_MODIFIED).map(|v| ("last-modified", v)));
                if let Some((kind, value)) = validator {
                    if let Ok(value) = value.to_str() {
                        return Ok(format!("{kind}:{value}"));
                    }
                }
            }
        }
        let content = self.download().await?;
        Ok(ArtifactStore::sha256_hex(content.as_bytes()))
    }

    async fn export_rows(&self) -> Result<Vec<Row>, AdapterError> {
        let content = self.download().await?;
        parse_sheet_values(&self.source_id, &content)
    }
}
