//! Picks which stored records get enriched next.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use provsync_adapters::schema::{CLINIC_ENRICHMENT_FIELDS, PLAN_DETAIL_FIELDS};
use provsync_adapters::ProviderRegistry;
use provsync_core::{EnrichmentTarget, RecordKind, StoredRecord};
use provsync_storage::{EnrichmentCandidate, RecordStore, StoreError};
use tracing::debug;

use crate::config::RunConfig;

const CLINIC_CONTEXT: &[&str] = &["name", "address", "city", "state", "postcode"];
const PLAN_CONTEXT: &[&str] = &[
    "plan_name",
    "provider_name",
    "detail_url",
    "source_url",
];

pub fn wanted_fields(kind: RecordKind) -> &'static [&'static str] {
    match kind {
        RecordKind::Clinic => CLINIC_ENRICHMENT_FIELDS,
        RecordKind::InsurancePlan => PLAN_DETAIL_FIELDS,
    }
}

#[derive(Clone)]
pub struct EnrichmentScheduler {
    store: Arc<dyn RecordStore>,
    registry: Arc<ProviderRegistry>,
    penalty_after: u32,
    penalty: Duration,
}

impl EnrichmentScheduler {
    pub fn new(store: Arc<dyn RecordStore>, registry: Arc<ProviderRegistry>, config: &RunConfig) -> Self {
        Self {
            store,
            registry,
            penalty_after: config.failure_penalty_after.max(1),
            penalty: config.failure_penalty,
        }
    }

    /// Never-attempted records first, then least recently attempted; repeated failures
    /// push a record back by the failure penalty.
    pub async fn select_batch(
        &self,
        kind: RecordKind,
        max_size: usize,
    ) -> Result<Vec<EnrichmentTarget>, StoreError> {
        let candidates = self.store.enrichment_candidates(kind).await?;
        let total = candidates.len();
        let targets: Vec<_> = candidates
            .into_iter()
            .filter_map(|candidate| self.target_for(candidate))
            .collect();
        let batch = prioritize(targets, self.penalty_after, self.penalty, max_size);
        debug!(%kind, candidates = total, selected = batch.len(), "enrichment batch selected");
        Ok(batch)
    }

    fn target_for(&self, candidate: EnrichmentCandidate) -> Option<EnrichmentTarget> {
        let EnrichmentCandidate { record, attempt } = candidate;
        let kind = record.record_kind;
        let missing = record.missing_fields(wanted_fields(kind));
        if missing.is_empty() {
            return None;
        }

        let provider_id = match kind {
            RecordKind::Clinic => self.registry.of_kind(RecordKind::Clinic).next()?.provider_id.clone(),
            RecordKind::InsurancePlan => {
                let id = record.value("provider_id")?.as_text()?;
                self.registry
                    .get(id)
                    .filter(|a| a.record_kind == RecordKind::InsurancePlan)?
                    .provider_id
                    .clone()
            }
        };

        let context_keys = match kind {
            RecordKind::Clinic => CLINIC_CONTEXT,
            RecordKind::InsurancePlan => PLAN_CONTEXT,
        };
        Some(EnrichmentTarget {
            external_id: record.external_id.clone(),
            record_kind: kind,
            provider_id,
            missing_fields: missing,
            context: context_from(&record, context_keys),
            last_attempt_at: attempt.as_ref().and_then(|a| a.last_attempt_at),
            consecutive_failures: attempt.map(|a| a.consecutive_failures).unwrap_or(0),
        })
    }
}

fn context_from(record: &StoredRecord, keys: &[&str]) -> BTreeMap<String, String> {
    keys.iter()
        .filter_map(|key| {
            let value = record.value(key)?.render();
            let value = value.trim();
            (!value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Orders targets by effective last attempt, drops duplicate ids and caps the batch.
pub fn prioritize(
    mut targets: Vec<EnrichmentTarget>,
    penalty_after: u32,
    penalty: Duration,
    max_size: usize,
) -> Vec<EnrichmentTarget> {
    let effective = |t: &EnrichmentTarget| {
        t.last_attempt_at.map(|at| {
            if t.consecutive_failures >= penalty_after {
                at + penalty
            } else {
                at
            }
        })
    };
    // None sorts before Some, so never-attempted records lead
    targets.sort_by(|a, b| {
        effective(a)
            .cmp(&effective(b))
            .then_with(|| a.external_id.cmp(&b.external_id))
    });

    let mut seen = HashSet::new();
    targets.retain(|t| seen.insert(t.external_id.clone()));
    targets.truncate(max_size);
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn target(id: &str, last: Option<DateTime<Utc>>, failures: u32) -> EnrichmentTarget {
        EnrichmentTarget {
            external_id: id.to_string(),
            record_kind: RecordKind::Clinic,
            provider_id: "google-maps".to_string(),
            missing_fields: vec!["phone".to_string()],
            context: BTreeMap::new(),
            last_attempt_at: last,
            consecutive_failures: failures,
        }
    }

    #[test]
    fn never_attempted_first_then_oldest_with_failure_penalty() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let targets = vec![
            target("recent", Some(t0 + Duration::hours(5)), 0),
            target("failing", Some(t0), 4),
            target("fresh", None, 0),
            target("old", Some(t0 + Duration::hours(1)), 1),
            target("fresh", None, 0),
        ];
        let ordered: Vec<_> = prioritize(targets, 3, Duration::hours(24), 10)
            .into_iter()
            .map(|t| t.external_id)
            .collect();
        assert_eq!(ordered, vec!["fresh", "old", "recent", "failing"]);
    }

    #[test]
    fn batch_is_capped() {
        let targets = (0..10).map(|i| target(&format!("c{i}"), None, 0)).collect();
        assert_eq!(prioritize(targets, 3, Duration::hours(24), 4).len(), 4);
    }
}
