//! Core domain model for provider sync and enrichment.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "provsync-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Clinic,
    InsurancePlan,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Clinic => "clinic",
            RecordKind::InsurancePlan => "insurance_plan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clinic" => Some(RecordKind::Clinic),
            "insurance_plan" => Some(RecordKind::InsurancePlan),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Integer,
    Bool,
    List,
    Coordinates,
}

/// A typed field value as stored, diffed and merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Integer(i64),
    Bool(bool),
    List(Vec<String>),
    Coordinates { lat: f64, lng: f64 },
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Kind of a non-null value.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(_) => Some(FieldKind::Text),
            FieldValue::Number(_) => Some(FieldKind::Number),
            FieldValue::Integer(_) => Some(FieldKind::Integer),
            FieldValue::Bool(_) => Some(FieldKind::Bool),
            FieldValue::List(_) => Some(FieldKind::List),
            FieldValue::Coordinates { .. } => Some(FieldKind::Coordinates),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Short human-readable rendering used in audit logs and reports.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(v) => v.to_string(),
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::List(items) => items.join(", "),
            FieldValue::Coordinates { lat, lng } => format!("{lat},{lng}"),
        }
    }
}

/// Provenance pointer attached to extracted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub source_url: String,
    pub selector_or_pointer: String,
    pub snippet: String,
    pub retrieved_at: DateTime<Utc>,
    pub extractor_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub value: FieldValue,
    pub confidence: f64,
    pub evidence: Option<EvidenceRef>,
}

impl ExtractedField {
    pub fn new(value: FieldValue, confidence: f64) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: EvidenceRef) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

/// One row of a source-of-truth export, keyed by a stable external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub external_id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub fingerprint: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub external_id: String,
    pub kind: ChangeKind,
    /// Full row for `added`, changed fields only for `updated`, empty for `removed`.
    pub payload: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub source_id: String,
    pub record_kind: RecordKind,
    pub observed_at: DateTime<Utc>,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentTarget {
    pub external_id: String,
    pub record_kind: RecordKind,
    pub provider_id: String,
    pub missing_fields: Vec<String>,
    /// Known fields used to build the scrape query (name, address, city, ...).
    pub context: BTreeMap<String, String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// A concrete page to fetch on behalf of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub target_id: String,
    pub provider_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub target_id: String,
    pub provider_id: String,
    pub url: String,
    /// Normalized URL + sorted query, used for in-run dedup.
    pub fingerprint: String,
    pub content: String,
    pub content_type: Option<String>,
    pub outcome: FetchOutcome,
    pub attempts: u32,
    pub error: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn is_success(&self) -> bool {
        self.outcome == FetchOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Fast,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Valid,
    Invalid { failures: Vec<ValidationFailure> },
    Unextractable { reason: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub target_id: String,
    pub record_kind: RecordKind,
    pub provider_id: String,
    pub source_url: String,
    pub fields: BTreeMap<String, ExtractedField>,
    pub tier: ExtractionTier,
    pub validation: ValidationOutcome,
    /// Fast-tier output below the confidence threshold that the deep tier did not replace.
    pub low_confidence: bool,
    /// The deep tier was wanted but CostGuard denied the reservation.
    #[serde(default)]
    pub budget_denied: bool,
    pub review_required: bool,
    pub retrieved_at: DateTime<Utc>,
}

impl ExtractedRecord {
    pub fn field_value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|f| &f.value)
    }

    pub fn is_mergeable(&self) -> bool {
        self.validation.is_valid() && !self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PlausibilityRule {
    Range { min: f64, max: f64 },
    OneOf { values: Vec<String> },
    Length { min: usize, max: usize },
    /// Case-insensitive substrings that mark a text value as implausible.
    Excludes { patterns: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub rule: Option<PlausibilityRule>,
    pub description: String,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            rule: None,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_rule(mut self, rule: PlausibilityRule) -> Self {
        self.rule = Some(rule);
        self
    }
}

/// Structured extraction schema the deep tier must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    SourceOfTruth,
    FastTier,
    DeepTier,
}

impl From<ExtractionTier> for FieldOrigin {
    fn from(tier: ExtractionTier) -> Self {
        match tier {
            ExtractionTier::Fast => FieldOrigin::FastTier,
            ExtractionTier::Deep => FieldOrigin::DeepTier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub value: FieldValue,
    pub origin: FieldOrigin,
    pub retrieved_at: DateTime<Utc>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub low_confidence: bool,
}

/// Durable record keyed by stable external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub external_id: String,
    pub record_kind: RecordKind,
    pub fields: BTreeMap<String, StoredField>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields
            .get(field)
            .map(|f| &f.value)
            .filter(|v| !v.is_null())
    }

    pub fn missing_fields(&self, wanted: &[&str]) -> Vec<String> {
        wanted
            .iter()
            .filter(|name| self.value(name).is_none())
            .map(|name| name.to_string())
            .collect()
    }
}

/// Losing side of an overlapping-field conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub external_id: String,
    pub field: String,
    pub kept: FieldValue,
    pub kept_origin: FieldOrigin,
    pub kept_retrieved_at: DateTime<Utc>,
    pub discarded: FieldValue,
    pub discarded_origin: FieldOrigin,
    pub discarded_retrieved_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub external_id: String,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub conflicted: usize,
    pub unchanged: usize,
    pub flagged_for_review: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.removed += other.removed;
        self.conflicted += other.conflicted;
        self.unchanged += other.unchanged;
        self.flagged_for_review += other.flagged_for_review;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Validation,
    BudgetExhausted,
    Fatal,
}

/// Non-fatal failure aggregated into a run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub target_id: String,
    pub class: FailureClass,
    pub message: String,
}

/// Stable id derived from the given key parts (case and surrounding space insensitive).
pub fn deterministic_id(parts: &[&str]) -> String {
    let key = parts
        .iter()
        .map(|p| p.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}
