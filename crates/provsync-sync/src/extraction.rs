//! Two-tier extraction: deterministic listing parse first, the document model only when
//! that parse is missing, incomplete or unsure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use provsync_adapters::insurance::{parse_int, parse_money};
use provsync_adapters::schema::{clinic_schema, insurance_plan_schema};
use provsync_adapters::{
    estimate_call_units, prepare_document, DeepOutput, DocumentModel, DocumentScraper,
    ProviderRegistry,
};
use provsync_core::{
    EnrichmentTarget, EvidenceRef, ExtractedField, ExtractedRecord, ExtractionSchema,
    ExtractionTier, FailureClass, FetchOutcome, FieldKind, FieldValue, RecordKind, ScrapeResult,
    ScrapeTarget, ValidationOutcome,
};
use provsync_storage::{ArtifactStore, RetryDisposition};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::cost::CostGuard;
use crate::scraper::ScraperEngine;
use crate::validation::{canonicalize, drop_implausible, validate};

pub const DEEP_EXTRACTOR_VERSION: &str = "document-model-v1";
const SNIPPET_CHARS: usize = 200;

pub fn schema_for(kind: RecordKind) -> ExtractionSchema {
    match kind {
        RecordKind::Clinic => clinic_schema(),
        RecordKind::InsurancePlan => insurance_plan_schema(),
    }
}

/// An extracted record plus the failure to report for it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record: ExtractedRecord,
    pub issue: Option<(FailureClass, String)>,
    pub deep_called: bool,
}

pub struct ExtractionPipeline {
    registry: Arc<ProviderRegistry>,
    model: Option<Arc<dyn DocumentModel>>,
    guard: CostGuard,
    confidence_threshold: f64,
    deep_estimate: f64,
    artifacts: Option<ArtifactStore>,
    engine: Option<Arc<ScraperEngine>>,
}

impl ExtractionPipeline {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        model: Option<Arc<dyn DocumentModel>>,
        guard: CostGuard,
        config: &RunConfig,
    ) -> Self {
        Self {
            registry,
            model,
            guard,
            confidence_threshold: config.confidence_threshold,
            deep_estimate: config.deep_estimate,
            artifacts: None,
            engine: None,
        }
    }

    /// Fetch linked brochures through `engine` when the deep tier runs.
    pub fn with_engine(mut self, engine: Arc<ScraperEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Retain invalid deep-tier scrapes under this store for inspection.
    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub async fn extract(&self, scrape: &ScrapeResult, target: &EnrichmentTarget) -> Extraction {
        let mut draft = Draft::new(scrape, target);

        if !scrape.is_success() {
            let reason = scrape.error.clone().unwrap_or_else(|| "fetch failed".to_string());
            let class = match scrape.outcome {
                FetchOutcome::PermanentFailure => FailureClass::Permanent,
                _ => FailureClass::Transient,
            };
            return draft.unextractable(reason, class);
        }
        let Some(adapter) = self.registry.get(&scrape.provider_id) else {
            return draft.unextractable(
                format!("no adapter for provider {}", scrape.provider_id),
                FailureClass::Permanent,
            );
        };
        let schema = adapter
            .document
            .as_ref()
            .map(|document| document.schema().clone())
            .unwrap_or_else(|| schema_for(target.record_kind));

        let mut fast = BTreeMap::new();
        if let Some(listing) = adapter.listing.as_ref().filter(|l| l.recognizes(&scrape.content)) {
            match listing.parse(scrape, target) {
                Ok(fields) => fast = fields,
                Err(err) => debug!(target_id = %target.external_id, error = %err, "fast-tier parse failed"),
            }
        }
        canonicalize(&mut fast, &schema);
        let dropped = drop_implausible(&mut fast, &schema);
        if !dropped.is_empty() {
            debug!(target_id = %target.external_id, ?dropped, "dropped implausible fast-tier fields");
        }

        let min_confidence = fast
            .values()
            .map(|f| f.confidence)
            .fold(f64::INFINITY, f64::min);
        let low_confidence = !fast.is_empty() && min_confidence < self.confidence_threshold;
        let missing_required = schema
            .required_fields()
            .any(|spec| fast.get(&spec.name).map_or(true, |f| f.value.is_null()));
        let needs_deep = fast.is_empty() || missing_required || low_confidence;

        if needs_deep {
            if let (Some(document), Some(model)) = (adapter.document.as_ref(), self.model.as_ref()) {
                let brochure = self.brochure(scrape, target, document.as_ref()).await;
                let source = brochure.as_ref().unwrap_or(scrape);
                match self
                    .deep(source, target, &schema, &document.document_text(&source.content), model.as_ref())
                    .await
                {
                    DeepAttempt::Extracted(fields) => {
                        draft.deep_called = true;
                        return self.finish_deep(draft, source, fields, &schema).await;
                    }
                    DeepAttempt::Denied => draft.budget_denied = true,
                    DeepAttempt::Failed { issued, class, message } => {
                        draft.deep_called = issued;
                        draft.deep_issue = Some((class, message));
                    }
                    DeepAttempt::Skipped(reason) => {
                        debug!(target_id = %target.external_id, reason, "deep tier skipped");
                    }
                }
            }
        }

        let flagged = low_confidence || draft.budget_denied;
        draft.fast(fast, &schema, flagged)
    }

    /// The brochure linked from the page, when an engine is attached and it downloads.
    async fn brochure(
        &self,
        scrape: &ScrapeResult,
        target: &EnrichmentTarget,
        document: &dyn DocumentScraper,
    ) -> Option<ScrapeResult> {
        let engine = self.engine.as_ref()?;
        let url = document.brochure_url(&scrape.content, &scrape.url)?;
        let brochure = engine
            .fetch(&ScrapeTarget {
                target_id: target.external_id.clone(),
                provider_id: scrape.provider_id.clone(),
                url: url.clone(),
            })
            .await;
        if brochure.is_success() {
            debug!(target_id = %target.external_id, url = %url, chars = brochure.content.len(), "using brochure for deep tier");
            Some(brochure)
        } else {
            warn!(
                target_id = %target.external_id,
                url = %url,
                error = brochure.error.as_deref().unwrap_or("fetch failed"),
                "brochure unavailable, reading the product page instead"
            );
            None
        }
    }

    async fn deep(
        &self,
        scrape: &ScrapeResult,
        target: &EnrichmentTarget,
        schema: &ExtractionSchema,
        text: &str,
        model: &dyn DocumentModel,
    ) -> DeepAttempt {
        let document = match prepare_document(text) {
            Ok(document) => document,
            Err(err) => return DeepAttempt::Skipped(err.to_string()),
        };
        let estimate = self
            .deep_estimate
            .max(estimate_call_units(&document, schema, &target.context));
        let Some(reservation) = self.guard.try_reserve(estimate) else {
            info!(
                target_id = %target.external_id,
                spent = self.guard.ledger().spent(),
                "deep tier denied by cost ceiling"
            );
            return DeepAttempt::Denied;
        };

        match model.extract(&document, schema, &target.context).await {
            Ok(output) => {
                let charged = reservation.settle(output.cost_units, true);
                debug!(target_id = %target.external_id, cost_units = charged, "deep tier answered");
                DeepAttempt::Extracted(coerce_deep_output(&output, schema, scrape))
            }
            Err(err) => {
                let issued = err.was_issued();
                let charged = reservation.settle(0.0, issued);
                warn!(target_id = %target.external_id, error = %err, cost_units = charged, "deep tier failed");
                let class = match err.disposition() {
                    RetryDisposition::Retryable => FailureClass::Transient,
                    RetryDisposition::NonRetryable => FailureClass::Permanent,
                };
                DeepAttempt::Failed {
                    issued,
                    class,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn finish_deep(
        &self,
        mut draft: Draft,
        scrape: &ScrapeResult,
        mut fields: BTreeMap<String, ExtractedField>,
        schema: &ExtractionSchema,
    ) -> Extraction {
        canonicalize(&mut fields, schema);
        let validation = validate(&fields, schema, ExtractionTier::Deep);
        let issue = match &validation {
            ValidationOutcome::Valid => None,
            ValidationOutcome::Invalid { failures } => {
                draft.review_required = true;
                let summary = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.field, f.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                self.retain(scrape, &summary).await;
                Some((FailureClass::Validation, summary))
            }
            ValidationOutcome::Unextractable { reason } => {
                draft.review_required = true;
                self.retain(scrape, reason).await;
                Some((FailureClass::Validation, reason.clone()))
            }
        };
        draft.build(fields, ExtractionTier::Deep, validation, false, issue)
    }

    async fn retain(&self, scrape: &ScrapeResult, reason: &str) {
        let Some(artifacts) = &self.artifacts else {
            return;
        };
        match artifacts.retain_scrape_result(scrape, reason).await {
            Ok(stored) => {
                debug!(path = %stored.relative_path.display(), "retained scrape for review");
            }
            Err(err) => warn!(target_id = %scrape.target_id, error = %err, "could not retain scrape"),
        }
    }
}

enum DeepAttempt {
    Extracted(BTreeMap<String, ExtractedField>),
    Denied,
    Failed {
        issued: bool,
        class: FailureClass,
        message: String,
    },
    Skipped(String),
}

struct Draft {
    target_id: String,
    record_kind: RecordKind,
    provider_id: String,
    source_url: String,
    retrieved_at: chrono::DateTime<Utc>,
    budget_denied: bool,
    review_required: bool,
    deep_called: bool,
    deep_issue: Option<(FailureClass, String)>,
}

impl Draft {
    fn new(scrape: &ScrapeResult, target: &EnrichmentTarget) -> Self {
        Self {
            target_id: target.external_id.clone(),
            record_kind: target.record_kind,
            provider_id: scrape.provider_id.clone(),
            source_url: scrape.url.clone(),
            retrieved_at: scrape.retrieved_at,
            budget_denied: false,
            review_required: false,
            deep_called: false,
            deep_issue: None,
        }
    }

    fn unextractable(self, reason: String, class: FailureClass) -> Extraction {
        let validation = ValidationOutcome::Unextractable {
            reason: reason.clone(),
        };
        self.build(
            BTreeMap::new(),
            ExtractionTier::Fast,
            validation,
            false,
            Some((class, reason)),
        )
    }

    fn fast(
        self,
        fields: BTreeMap<String, ExtractedField>,
        schema: &ExtractionSchema,
        low_confidence: bool,
    ) -> Extraction {
        let validation = validate(&fields, schema, ExtractionTier::Fast);
        let issue = if validation.is_valid() {
            None
        } else if self.budget_denied {
            Some((FailureClass::BudgetExhausted, "deep tier denied by cost ceiling".to_string()))
        } else if let Some(issue) = self.deep_issue.clone() {
            Some(issue)
        } else {
            let reason = match &validation {
                ValidationOutcome::Unextractable { reason } => reason.clone(),
                _ => "fast-tier output failed validation".to_string(),
            };
            Some((FailureClass::Validation, reason))
        };
        self.build(fields, ExtractionTier::Fast, validation, low_confidence, issue)
    }

    fn build(
        self,
        fields: BTreeMap<String, ExtractedField>,
        tier: ExtractionTier,
        validation: ValidationOutcome,
        low_confidence: bool,
        issue: Option<(FailureClass, String)>,
    ) -> Extraction {
        Extraction {
            record: ExtractedRecord {
                target_id: self.target_id,
                record_kind: self.record_kind,
                provider_id: self.provider_id,
                source_url: self.source_url,
                fields,
                tier,
                validation,
                low_confidence,
                budget_denied: self.budget_denied,
                review_required: self.review_required,
                retrieved_at: self.retrieved_at,
            },
            issue,
            deep_called: self.deep_called,
        }
    }
}

/// Converts raw model JSON into typed fields. Fields outside the schema and nulls are
/// dropped; values that cannot be coerced keep their text form so validation reports them.
pub fn coerce_deep_output(
    output: &DeepOutput,
    schema: &ExtractionSchema,
    scrape: &ScrapeResult,
) -> BTreeMap<String, ExtractedField> {
    let mut fields = BTreeMap::new();
    for (name, raw) in &output.fields {
        let Some(spec) = schema.field(name) else {
            debug!(field = %name, "deep tier returned a field outside the schema");
            continue;
        };
        let value = coerce_value(spec.kind, raw);
        if value.is_null() {
            continue;
        }
        let snippet: String = value.render().chars().take(SNIPPET_CHARS).collect();
        let evidence = EvidenceRef {
            source_url: scrape.url.clone(),
            selector_or_pointer: format!("/{name}"),
            snippet,
            retrieved_at: scrape.retrieved_at,
            extractor_version: DEEP_EXTRACTOR_VERSION.to_string(),
        };
        fields.insert(
            name.clone(),
            ExtractedField::new(value, output.confidence(name)).with_evidence(evidence),
        );
    }
    fields
}

pub fn coerce_value(kind: FieldKind, raw: &Value) -> FieldValue {
    match (kind, raw) {
        (_, Value::Null) => FieldValue::Null,
        (FieldKind::Text, Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::text(s)
            }
        }
        (FieldKind::Text, Value::Number(n)) => FieldValue::text(n.to_string()),
        (FieldKind::Number, Value::Number(n)) => n.as_f64().map_or(FieldValue::Null, FieldValue::Number),
        (FieldKind::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .or_else(|| parse_money(s))
            .map_or_else(|| FieldValue::text(s.trim()), FieldValue::Number),
        (FieldKind::Integer, Value::Number(n)) => match n.as_i64() {
            Some(v) => FieldValue::Integer(v),
            None => match n.as_f64() {
                Some(v) if v.fract() == 0.0 => FieldValue::Integer(v as i64),
                _ => FieldValue::text(n.to_string()),
            },
        },
        (FieldKind::Integer, Value::String(s)) => {
            parse_int(s).map_or_else(|| FieldValue::text(s.trim()), FieldValue::Integer)
        }
        (FieldKind::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
        (FieldKind::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => FieldValue::Bool(false),
            Some(1) => FieldValue::Bool(true),
            _ => FieldValue::text(n.to_string()),
        },
        (FieldKind::Bool, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "1" => FieldValue::Bool(true),
            "no" | "n" | "false" | "0" => FieldValue::Bool(false),
            other => FieldValue::text(other),
        },
        (FieldKind::List, Value::Array(items)) => {
            let items: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::List(items)
            }
        }
        (FieldKind::List, Value::String(s)) => {
            let items: Vec<String> = s
                .split([',', ';'])
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if items.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::List(items)
            }
        }
        (FieldKind::Coordinates, value) => coerce_coordinates(value)
            .map_or_else(|| FieldValue::text(value.to_string()), |(lat, lng)| {
                FieldValue::Coordinates { lat, lng }
            }),
        (_, other) => FieldValue::text(other.to_string()),
    }
}

fn coerce_coordinates(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Object(map) => {
            let lat = map.get("lat").or_else(|| map.get("latitude"))?.as_f64()?;
            let lng = map
                .get("lng")
                .or_else(|| map.get("lon"))
                .or_else(|| map.get("longitude"))?
                .as_f64()?;
            Some((lat, lng))
        }
        Value::Array(items) if items.len() == 2 => Some((items[0].as_f64()?, items[1].as_f64()?)),
        Value::String(s) => {
            let (lat, lng) = s.split_once(',')?;
            Some((lat.trim().parse().ok()?, lng.trim().parse().ok()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_strings_are_coerced_to_schema_kinds() {
        assert_eq!(
            coerce_value(FieldKind::Number, &json!("RM 1,000,000")),
            FieldValue::Number(1_000_000.0)
        );
        assert_eq!(coerce_value(FieldKind::Number, &json!("1.5 million")), FieldValue::Number(1_500_000.0));
        assert_eq!(coerce_value(FieldKind::Bool, &json!("Yes")), FieldValue::Bool(true));
        assert_eq!(coerce_value(FieldKind::Integer, &json!(65.0)), FieldValue::Integer(65));
        assert_eq!(
            coerce_value(FieldKind::List, &json!("cancer; heart disease")),
            FieldValue::List(vec!["cancer".into(), "heart disease".into()])
        );
        assert_eq!(
            coerce_value(FieldKind::Coordinates, &json!({"lat": 3.15, "lng": 101.7})),
            FieldValue::Coordinates { lat: 3.15, lng: 101.7 }
        );
        assert_eq!(
            coerce_value(FieldKind::Number, &json!("unlimited")),
            FieldValue::text("unlimited")
        );
        assert_eq!(coerce_value(FieldKind::Text, &json!(null)), FieldValue::Null);
    }
}
