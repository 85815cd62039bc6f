//! Document-understanding capability behind the deep extraction tier.

use std::collections::BTreeMap;

use async_trait::async_trait;
use provsync_core::{ExtractionSchema, FieldKind};
use provsync_storage::RetryDisposition;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const MIN_DOCUMENT_CHARS: usize = 100;
pub const MAX_DOCUMENT_CHARS: usize = 50_000;
pub const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";
pub const DEFAULT_FIELD_CONFIDENCE: f64 = 0.85;
const MAX_COMPLETION_TOKENS: u32 = 4000;
const CONFIDENCE_KEY: &str = "_confidence";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocumentModelError {
    #[error("document model not configured")]
    NotConfigured,
    #[error("document unusable: {0}")]
    Unusable(String),
    #[error("transport error: {message}")]
    Transport { message: String, issued: bool },
    #[error("model api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed model output: {0}")]
    Malformed(String),
}

impl DocumentModelError {
    /// Whether the billable call reached the provider.
    pub fn was_issued(&self) -> bool {
        match self {
            DocumentModelError::NotConfigured | DocumentModelError::Unusable(_) => false,
            DocumentModelError::Transport { issued, .. } => *issued,
            DocumentModelError::Api { .. } | DocumentModelError::Malformed(_) => true,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DocumentModelError::Transport { .. } => RetryDisposition::Retryable,
            DocumentModelError::Api { status, .. } => StatusCode::from_u16(*status)
                .map(provsync_storage::classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Raw model answer: JSON values keyed by schema field, before coercion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeepOutput {
    pub fields: Map<String, Value>,
    pub confidences: BTreeMap<String, f64>,
    pub cost_units: f64,
}

impl DeepOutput {
    pub fn confidence(&self, field: &str) -> f64 {
        self.confidences
            .get(field)
            .copied()
            .unwrap_or(DEFAULT_FIELD_CONFIDENCE)
    }
}

#[async_trait]
pub trait DocumentModel: Send + Sync {
    async fn extract(
        &self,
        document: &str,
        schema: &ExtractionSchema,
        context: &BTreeMap<String, String>,
    ) -> Result<DeepOutput, DocumentModelError>;
}

/// Rejects near-empty documents and truncates oversized ones.
pub fn prepare_document(text: &str) -> Result<String, DocumentModelError> {
    let text = text.trim();
    let chars = text.chars().count();
    if chars < MIN_DOCUMENT_CHARS {
        return Err(DocumentModelError::Unusable(format!(
            "document has {chars} chars, need at least {MIN_DOCUMENT_CHARS}"
        )));
    }
    if chars <= MAX_DOCUMENT_CHARS {
        return Ok(text.to_string());
    }
    let mut truncated: String = text.chars().take(MAX_DOCUMENT_CHARS).collect();
    truncated.push_str(TRUNCATION_MARKER);
    Ok(truncated)
}

/// Cost units a call on `document` is expected to consume (thousands of tokens).
pub fn estimate_cost_units(document: &str) -> f64 {
    let prompt_tokens = document.chars().count() as f64 / 4.0;
    (prompt_tokens + f64::from(MAX_COMPLETION_TOKENS)) / 1000.0
}

/// Upper-bound cost of one call: the full prompt as sent plus the completion cap.
pub fn estimate_call_units(
    document: &str,
    schema: &ExtractionSchema,
    context: &BTreeMap<String, String>,
) -> f64 {
    let system_tokens = system_prompt().chars().count() as f64 / 4.0;
    estimate_cost_units(&user_prompt(document, schema, context)) + system_tokens / 1000.0
}

fn kind_hint(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "string",
        FieldKind::Number => "number",
        FieldKind::Integer => "integer",
        FieldKind::Bool => "boolean",
        FieldKind::List => "array of strings",
        FieldKind::Coordinates => "object with lat and lng",
    }
}

fn system_prompt() -> &'static str {
    "You are an expert insurance analyst. Extract structured information from \
     provider documents and return valid JSON only. Use null for anything the \
     document does not state. Never invent values."
}

fn user_prompt(document: &str, schema: &ExtractionSchema, context: &BTreeMap<String, String>) -> String {
    let mut prompt = String::from("Extract the following fields as one JSON object:\n");
    for field in &schema.fields {
        let required = if field.required { " (required)" } else { "" };
        prompt.push_str(&format!(
            "- {}: {}{} - {}\n",
            field.name,
            kind_hint(field.kind),
            required,
            field.description
        ));
    }
    prompt.push_str(&format!(
        "Also include \"{CONFIDENCE_KEY}\": an object mapping each extracted field to a confidence between 0 and 1.\n"
    ));
    if !context.is_empty() {
        prompt.push_str("\nContext:\n");
        for (key, value) in context {
            prompt.push_str(&format!("{key}: {value}\n"));
        }
    }
    prompt.push_str("\nDocument:\n");
    prompt.push_str(document);
    prompt
}

/// Splits the model's JSON object into field values and the confidence map.
pub fn parse_model_json(raw: &str) -> Result<(Map<String, Value>, BTreeMap<String, f64>), DocumentModelError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DocumentModelError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DocumentModelError::Malformed("expected a JSON object".into()));
    };
    let confidences = match fields.remove(CONFIDENCE_KEY) {
        Some(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_f64().map(|c| (k, c.clamp(0.0, 1.0))))
            .collect(),
        _ => BTreeMap::new(),
    };
    Ok((fields, confidences))
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

/// OpenAI chat-completions backed model in JSON-object mode.
#[derive(Clone)]
pub struct OpenAiDocumentModel {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiDocumentModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Custom base URL (proxies, compatible gateways).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl DocumentModel for OpenAiDocumentModel {
    async fn extract(
        &self,
        document: &str,
        schema: &ExtractionSchema,
        context: &BTreeMap<String, String>,
    ) -> Result<DeepOutput, DocumentModelError> {
        if self.api_key.trim().is_empty() {
            return Err(DocumentModelError::NotConfigured);
        }
        let document = prepare_document(document)?;
        let prompt = user_prompt(&document, schema, context);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt().to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.clone(),
                },
            ],
            temperature: 0.1,
            max_tokens: MAX_COMPLETION_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| DocumentModelError::Transport {
                // connect failures never reached the provider
                issued: !e.is_connect(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| DocumentModelError::Malformed(e.to_string()))?;
        let cost_units = chat
            .usage
            .as_ref()
            .map(|u| u.total_tokens as f64 / 1000.0)
            .unwrap_or_else(|| estimate_cost_units(&prompt));
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| DocumentModelError::Malformed("no choices in response".into()))?;
        let (fields, confidences) = parse_model_json(&content)?;
        debug!(model = %self.model, cost_units, fields = fields.len(), "deep extraction returned");

        Ok(DeepOutput {
            fields,
            confidences,
            cost_units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_documents_are_unusable_and_long_ones_truncated() {
        let err = prepare_document("too short").unwrap_err();
        assert!(!err.was_issued());

        let long = "x".repeat(MAX_DOCUMENT_CHARS + 10);
        let prepared = prepare_document(&long).expect("prepared");
        assert!(prepared.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            prepared.chars().count(),
            MAX_DOCUMENT_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn call_estimate_covers_prompt_and_completion_cap() {
        let schema = crate::schema::insurance_plan_schema();
        let document = "a".repeat(8_000);
        let estimate = estimate_call_units(&document, &schema, &BTreeMap::new());
        // 2000 document tokens plus the 4000-token completion cap, plus schema text
        assert!(estimate > 6.0, "estimate {estimate}");
        assert!(estimate > estimate_cost_units(&document));
    }

    #[test]
    fn model_json_separates_confidence_map() {
        let raw = r#"{"plan_name":"A-Plus Med","annual_limit":"RM 1,000,000",
            "_confidence":{"plan_name":0.97,"annual_limit":1.4}}"#;
        let (fields, confidences) = parse_model_json(raw).expect("json");
        assert_eq!(fields.len(), 2);
        assert_eq!(confidences["plan_name"], 0.97);
        assert_eq!(confidences["annual_limit"], 1.0);
        assert!(matches!(
            parse_model_json("[1,2]"),
            Err(DocumentModelError::Malformed(_))
        ));
    }

    #[test]
    fn issued_and_retry_classification() {
        let throttled = DocumentModelError::Api {
            status: 429,
            body: String::new(),
        };
        assert!(throttled.was_issued());
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
        assert!(!DocumentModelError::NotConfigured.was_issued());
        let refused = DocumentModelError::Transport {
            message: "connection refused".into(),
            issued: false,
        };
        assert!(!refused.was_issued());
    }

    #[tokio::test]
    async fn empty_api_key_is_not_configured() {
        let model = OpenAiDocumentModel::new("");
        let err = model
            .extract(&"a".repeat(200), &crate::schema::insurance_plan_schema(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, DocumentModelError::NotConfigured);
    }
}
