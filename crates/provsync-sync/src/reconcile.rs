//! Merges change sets and extracted records into the durable store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use provsync_core::{
    AttemptRecord, AuditEntry, ChangeKind, ChangeSet, ExtractedRecord, FieldOrigin, FieldValue,
    MergeReport, RecordKind, StoredField, StoredRecord,
};
use provsync_storage::{RecordOp, RecordStore, StoreError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Outcome of offering one incoming value for a stored field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMerge {
    Unchanged,
    Set(StoredField),
    /// Both sides held different values; `lost` goes to the audit log.
    Conflict {
        kept: StoredField,
        lost: StoredField,
        replaced: bool,
    },
}

/// The more recently retrieved value wins. A low-confidence value never displaces a
/// confident one, and ties keep what is stored.
pub fn merge_field(current: Option<&StoredField>, incoming: StoredField) -> FieldMerge {
    let Some(current) = current.filter(|c| !c.value.is_null()) else {
        if incoming.value.is_null() {
            return FieldMerge::Unchanged;
        }
        return FieldMerge::Set(incoming);
    };
    if current.value == incoming.value {
        return FieldMerge::Unchanged;
    }

    let same_origin = current.origin == incoming.origin;
    let incoming_newer = incoming.retrieved_at > current.retrieved_at;
    let blocked = incoming.low_confidence && !current.low_confidence;

    if same_origin && incoming_newer && !blocked {
        return FieldMerge::Set(incoming);
    }
    if incoming_newer && !blocked {
        FieldMerge::Conflict {
            kept: incoming,
            lost: current.clone(),
            replaced: true,
        }
    } else {
        FieldMerge::Conflict {
            kept: current.clone(),
            lost: incoming,
            replaced: false,
        }
    }
}

fn audit(external_id: &str, field: &str, kept: &StoredField, lost: &StoredField) -> AuditEntry {
    AuditEntry {
        external_id: external_id.to_string(),
        field: field.to_string(),
        kept: kept.value.clone(),
        kept_origin: kept.origin,
        kept_retrieved_at: kept.retrieved_at,
        discarded: lost.value.clone(),
        discarded_origin: lost.origin,
        discarded_retrieved_at: lost.retrieved_at,
        recorded_at: Utc::now(),
    }
}

/// Applies incoming fields to a record. Returns `(changed, conflicts)`.
fn apply_fields(
    record: &mut StoredRecord,
    incoming: BTreeMap<String, StoredField>,
    audits: &mut Vec<AuditEntry>,
) -> (bool, usize) {
    let mut changed = false;
    let mut conflicts = 0;
    for (name, field) in incoming {
        match merge_field(record.fields.get(&name), field) {
            FieldMerge::Unchanged => {}
            FieldMerge::Set(field) => {
                record.fields.insert(name, field);
                changed = true;
            }
            FieldMerge::Conflict { kept, lost, replaced } => {
                conflicts += 1;
                audits.push(audit(&record.external_id, &name, &kept, &lost));
                if replaced {
                    record.fields.insert(name, kept);
                    changed = true;
                }
            }
        }
    }
    (changed, conflicts)
}

/// Serializes merges per external id; every merge lands in one store transaction.
pub struct SyncReconciler {
    store: Arc<dyn RecordStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncReconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Locks are taken in sorted id order so overlapping merges cannot deadlock.
    async fn lock_ids(&self, ids: &BTreeSet<String>) -> Vec<OwnedMutexGuard<()>> {
        let mutexes: Vec<_> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .map(|id| locks.entry(id.clone()).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    async fn load(&self, ids: &BTreeSet<String>) -> Result<HashMap<String, StoredRecord>, StoreError> {
        let ids: Vec<String> = ids.iter().cloned().collect();
        Ok(self
            .store
            .get_records(&ids)
            .await?
            .into_iter()
            .map(|r| (r.external_id.clone(), r))
            .collect())
    }

    pub async fn merge_changes(&self, change_set: &ChangeSet) -> Result<MergeReport, StoreError> {
        let ids: BTreeSet<String> = change_set.changes.iter().map(|c| c.external_id.clone()).collect();
        let _guards = self.lock_ids(&ids).await;
        let mut existing = self.load(&ids).await?;

        let at = change_set.observed_at;
        let mut report = MergeReport::default();
        let mut audits = Vec::new();
        let mut ops = Vec::new();

        for change in &change_set.changes {
            let incoming: BTreeMap<String, StoredField> = change
                .payload
                .iter()
                .map(|(name, value)| (name.clone(), source_field(value.clone(), at)))
                .collect();

            match (change.kind, existing.remove(&change.external_id)) {
                (ChangeKind::Removed, Some(record)) if record.active => {
                    ops.push(RecordOp::Deactivate {
                        external_id: record.external_id,
                        at,
                    });
                    report.removed += 1;
                }
                (ChangeKind::Removed, _) => report.unchanged += 1,
                (_, Some(mut record)) => {
                    let (changed, conflicts) = apply_fields(&mut record, incoming, &mut audits);
                    report.conflicted += conflicts;
                    if changed || !record.active {
                        record.active = true;
                        record.updated_at = at;
                        ops.push(RecordOp::Upsert(record));
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                (_, None) => {
                    let fields = incoming.into_iter().filter(|(_, f)| !f.value.is_null()).collect();
                    ops.push(RecordOp::Upsert(StoredRecord {
                        external_id: change.external_id.clone(),
                        record_kind: change_set.record_kind,
                        fields,
                        active: true,
                        created_at: at,
                        updated_at: at,
                    }));
                    report.inserted += 1;
                }
            }
        }

        ops.extend(audits.into_iter().map(RecordOp::Audit));
        self.store.apply(ops).await?;
        info!(
            source_id = %change_set.source_id,
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            conflicted = report.conflicted,
            "change set merged"
        );
        Ok(report)
    }

    pub async fn merge_extracted(&self, records: &[ExtractedRecord]) -> Result<MergeReport, StoreError> {
        self.merge_enrichment(records, Vec::new()).await
    }

    /// Merges extracted records and stores attempt bookkeeping in the same transaction.
    pub async fn merge_enrichment(
        &self,
        records: &[ExtractedRecord],
        attempts: Vec<AttemptRecord>,
    ) -> Result<MergeReport, StoreError> {
        let ids: BTreeSet<String> = records
            .iter()
            .map(|r| r.target_id.clone())
            .chain(attempts.iter().map(|a| a.external_id.clone()))
            .collect();
        let _guards = self.lock_ids(&ids).await;
        let mut existing = self.load(&ids).await?;

        let mut report = MergeReport::default();
        let mut audits = Vec::new();
        let mut touched: BTreeMap<String, StoredRecord> = BTreeMap::new();

        for extracted in records {
            if !extracted.is_mergeable() {
                if extracted.review_required {
                    report.flagged_for_review += 1;
                }
                continue;
            }
            let incoming = extracted_fields(extracted);
            let id = &extracted.target_id;

            let current = touched.remove(id).or_else(|| existing.remove(id));
            match current {
                Some(mut record) => {
                    let (changed, conflicts) = apply_fields(&mut record, incoming, &mut audits);
                    report.conflicted += conflicts;
                    if changed {
                        record.updated_at = extracted.retrieved_at.max(record.updated_at);
                        report.updated += 1;
                        touched.insert(id.clone(), record);
                    } else {
                        report.unchanged += 1;
                        existing.insert(id.clone(), record);
                    }
                }
                None if extracted.record_kind == RecordKind::InsurancePlan => {
                    let now = extracted.retrieved_at;
                    touched.insert(
                        id.clone(),
                        StoredRecord {
                            external_id: id.clone(),
                            record_kind: extracted.record_kind,
                            fields: incoming,
                            active: true,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    report.inserted += 1;
                }
                None => {
                    warn!(external_id = %id, "extracted record has no stored clinic, skipping");
                }
            }
        }

        let mut ops: Vec<RecordOp> = touched.into_values().map(RecordOp::Upsert).collect();
        ops.extend(audits.into_iter().map(RecordOp::Audit));
        ops.extend(attempts.into_iter().map(RecordOp::Attempt));
        if ops.is_empty() {
            return Ok(report);
        }
        self.store.apply(ops).await?;
        debug!(
            updated = report.updated,
            inserted = report.inserted,
            conflicted = report.conflicted,
            flagged = report.flagged_for_review,
            "extracted records merged"
        );
        Ok(report)
    }
}

fn source_field(value: FieldValue, at: DateTime<Utc>) -> StoredField {
    StoredField {
        value,
        origin: FieldOrigin::SourceOfTruth,
        retrieved_at: at,
        confidence: None,
        low_confidence: false,
    }
}

fn extracted_fields(record: &ExtractedRecord) -> BTreeMap<String, StoredField> {
    record
        .fields
        .iter()
        .filter(|(_, f)| !f.value.is_null())
        .map(|(name, field)| {
            (
                name.clone(),
                StoredField {
                    value: field.value.clone(),
                    origin: FieldOrigin::from(record.tier),
                    retrieved_at: record.retrieved_at,
                    confidence: Some(field.confidence),
                    low_confidence: record.low_confidence,
                },
            )
        })
        .collect()
}
