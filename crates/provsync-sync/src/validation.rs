//! Schema and plausibility checks applied to extracted fields.

use std::collections::BTreeMap;

use provsync_core::{
    ExtractedField, ExtractionSchema, ExtractionTier, FieldKind, FieldSpec, FieldValue,
    PlausibilityRule, ValidationFailure, ValidationOutcome,
};

/// Why `value` does not satisfy `spec`, if it does not.
pub fn check_field(spec: &FieldSpec, value: &FieldValue) -> Option<String> {
    if value.is_null() {
        return spec.required.then(|| "required field is null".to_string());
    }

    let kind_ok = match (spec.kind, value) {
        (FieldKind::Number, FieldValue::Integer(_)) => true,
        (kind, value) => value.kind() == Some(kind),
    };
    if !kind_ok {
        return Some(format!("expected {:?}, got {:?}", spec.kind, value.kind()));
    }

    match value {
        FieldValue::Text(text) if text.trim().is_empty() => {
            return Some("empty text".to_string());
        }
        FieldValue::Number(v) if !v.is_finite() => {
            return Some("not a finite number".to_string());
        }
        FieldValue::Coordinates { lat, lng }
            if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lng) =>
        {
            return Some(format!("coordinates {lat},{lng} out of range"));
        }
        _ => {}
    }

    match spec.rule.as_ref()? {
        PlausibilityRule::Range { min, max } => {
            let v = value.as_f64()?;
            (v < *min || v > *max).then(|| format!("{v} outside {min}..={max}"))
        }
        PlausibilityRule::OneOf { values } => {
            let text = value.as_text()?;
            (!values.iter().any(|allowed| allowed.eq_ignore_ascii_case(text.trim())))
                .then(|| format!("{text:?} is not one of {}", values.join(", ")))
        }
        PlausibilityRule::Length { min, max } => {
            let len = value.as_text()?.chars().count();
            (len < *min || len > *max).then(|| format!("length {len} outside {min}..={max}"))
        }
        PlausibilityRule::Excludes { patterns } => {
            let lower = value.as_text()?.to_lowercase();
            patterns
                .iter()
                .find(|p| lower.contains(p.as_str()))
                .map(|p| format!("contains {p:?}"))
        }
    }
}

/// Rewrites text values of enumerated fields to the allowed spelling, so "medical"
/// is stored as "Medical". Values outside the list are left for validation to report.
pub fn canonicalize(fields: &mut BTreeMap<String, ExtractedField>, schema: &ExtractionSchema) {
    for (name, field) in fields.iter_mut() {
        let Some(PlausibilityRule::OneOf { values }) = schema.field(name).and_then(|s| s.rule.as_ref()) else {
            continue;
        };
        let Some(text) = field.value.as_text() else {
            continue;
        };
        let canonical = values
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(text.trim()))
            .filter(|allowed| allowed.as_str() != text);
        if let Some(allowed) = canonical {
            field.value = FieldValue::text(allowed.clone());
        }
    }
}

/// Removes optional fields that fail their checks and fields outside the schema.
/// Returns the names that were dropped.
pub fn drop_implausible(
    fields: &mut BTreeMap<String, ExtractedField>,
    schema: &ExtractionSchema,
) -> Vec<String> {
    let mut dropped = Vec::new();
    fields.retain(|name, field| {
        let keep = match schema.field(name) {
            Some(spec) if spec.required => true,
            Some(spec) => check_field(spec, &field.value).is_none(),
            None => false,
        };
        if !keep {
            dropped.push(name.clone());
        }
        keep
    });
    dropped
}

/// Fast-tier output is judged on required fields only; deep-tier output must pass every check.
pub fn validate(
    fields: &BTreeMap<String, ExtractedField>,
    schema: &ExtractionSchema,
    tier: ExtractionTier,
) -> ValidationOutcome {
    if fields.values().all(|f| f.value.is_null()) {
        return ValidationOutcome::Unextractable {
            reason: "no fields extracted".to_string(),
        };
    }

    let mut failures = Vec::new();
    for spec in schema.required_fields() {
        if fields.get(&spec.name).map_or(true, |f| f.value.is_null()) {
            failures.push(ValidationFailure {
                field: spec.name.clone(),
                reason: "required field missing".to_string(),
            });
        }
    }

    for (name, field) in fields {
        let reason = match schema.field(name) {
            None if tier == ExtractionTier::Deep => Some("not in schema".to_string()),
            None => None,
            Some(spec) if spec.required || tier == ExtractionTier::Deep => {
                check_field(spec, &field.value)
            }
            Some(_) => None,
        };
        if let Some(reason) = reason {
            if failures.iter().all(|f: &ValidationFailure| f.field != *name) {
                failures.push(ValidationFailure {
                    field: name.clone(),
                    reason,
                });
            }
        }
    }

    if failures.is_empty() {
        ValidationOutcome::Valid
    } else {
        ValidationOutcome::Invalid { failures }
    }
}
