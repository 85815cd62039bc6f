//! Fingerprint-gated change detection against the last committed source snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use provsync_adapters::SourceOfTruth;
use provsync_core::{Change, ChangeKind, ChangeSet, FieldValue, Row, SourceSnapshot};
use provsync_storage::{RecordStore, SnapshotState, StoreError};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The live fingerprint equals the committed one; nothing was exported.
    NoChange(SourceSnapshot),
    Changed(PendingChanges),
}

/// A detected change set plus the snapshot to commit once it has been merged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChanges {
    pub change_set: ChangeSet,
    state: SnapshotState,
}

impl PendingChanges {
    pub fn snapshot(&self) -> &SourceSnapshot {
        &self.state.snapshot
    }
}

#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn RecordStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn detect(&self, source: &dyn SourceOfTruth) -> Result<Detection> {
        let source_id = source.source_id().to_string();
        let fingerprint = source
            .current_fingerprint()
            .await
            .with_context(|| format!("fingerprinting source {source_id}"))?;
        let previous = self
            .store
            .last_snapshot(&source_id)
            .await
            .with_context(|| format!("loading snapshot for {source_id}"))?;

        if let Some(previous) = &previous {
            if previous.snapshot.fingerprint == fingerprint {
                debug!(source_id, fingerprint, "source unchanged");
                return Ok(Detection::NoChange(previous.snapshot.clone()));
            }
        }

        let rows = source
            .export_rows()
            .await
            .with_context(|| format!("exporting rows from {source_id}"))?;
        let previous_rows = previous.map(|p| p.rows).unwrap_or_default();
        let changes = diff_rows(&previous_rows, &rows);
        let observed_at = Utc::now();
        let change_set = ChangeSet {
            source_id: source_id.clone(),
            record_kind: source.record_kind(),
            observed_at,
            changes,
        };
        info!(
            source_id,
            added = change_set.count(ChangeKind::Added),
            updated = change_set.count(ChangeKind::Updated),
            removed = change_set.count(ChangeKind::Removed),
            "source changed"
        );

        Ok(Detection::Changed(PendingChanges {
            change_set,
            state: SnapshotState {
                snapshot: SourceSnapshot {
                    source_id,
                    fingerprint,
                    observed_at,
                },
                rows,
            },
        }))
    }

    /// Persists the snapshot; call only after the change set has been merged.
    pub async fn confirm(&self, pending: PendingChanges) -> Result<(), StoreError> {
        self.store.commit_snapshot(pending.state).await
    }
}

/// Structural diff keyed by external id. Added and updated entries follow the current
/// export's order; removals follow the previous order.
pub fn diff_rows(previous: &[Row], current: &[Row]) -> Vec<Change> {
    let before: HashMap<&str, &Row> = previous.iter().map(|r| (r.external_id.as_str(), r)).collect();
    let after: HashMap<&str, &Row> = current.iter().map(|r| (r.external_id.as_str(), r)).collect();

    let mut changes = Vec::new();
    for row in current {
        match before.get(row.external_id.as_str()) {
            None => changes.push(Change {
                external_id: row.external_id.clone(),
                kind: ChangeKind::Added,
                payload: row.fields.clone(),
            }),
            Some(old) => {
                let payload = changed_fields(&old.fields, &row.fields);
                if !payload.is_empty() {
                    changes.push(Change {
                        external_id: row.external_id.clone(),
                        kind: ChangeKind::Updated,
                        payload,
                    });
                }
            }
        }
    }
    for row in previous {
        if !after.contains_key(row.external_id.as_str()) {
            changes.push(Change {
                external_id: row.external_id.clone(),
                kind: ChangeKind::Removed,
                payload: BTreeMap::new(),
            });
        }
    }
    changes
}

fn changed_fields(
    old: &BTreeMap<String, FieldValue>,
    new: &BTreeMap<String, FieldValue>,
) -> BTreeMap<String, FieldValue> {
    let mut payload: BTreeMap<String, FieldValue> = new
        .iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    // fields dropped from the export are cleared
    for (name, value) in old {
        if !new.contains_key(name) && !value.is_null() {
            payload.insert(name.clone(), FieldValue::Null);
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, fields: &[(&str, &str)]) -> Row {
        Row {
            external_id: id.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::text(*v)))
                .collect(),
        }
    }

    #[test]
    fn single_field_edit_yields_update_with_only_that_field() {
        let previous = vec![
            row("a", &[("name", "Klinik A"), ("city", "Ampang")]),
            row("b", &[("name", "Klinik B"), ("city", "Cheras")]),
        ];
        let current = vec![
            row("b", &[("name", "Klinik B"), ("city", "Kajang")]),
            row("c", &[("name", "Klinik C"), ("city", "Klang")]),
        ];
        let changes = diff_rows(&previous, &current);
        let kinds: Vec<_> = changes.iter().map(|c| (c.external_id.as_str(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("b", ChangeKind::Updated),
                ("c", ChangeKind::Added),
                ("a", ChangeKind::Removed),
            ]
        );
        assert_eq!(changes[0].payload.len(), 1);
        assert_eq!(changes[0].payload["city"], FieldValue::text("Kajang"));
    }

    #[test]
    fn reordered_rows_produce_no_changes() {
        let a = row("a", &[("name", "Klinik A")]);
        let b = row("b", &[("name", "Klinik B")]);
        assert!(diff_rows(&[a.clone(), b.clone()], &[b, a]).is_empty());
    }

    #[test]
    fn dropped_column_is_cleared() {
        let previous = vec![row("a", &[("name", "Klinik A"), ("postcode", "68000")])];
        let current = vec![row("a", &[("name", "Klinik A")])];
        let changes = diff_rows(&previous, &current);
        assert_eq!(changes[0].payload["postcode"], FieldValue::Null);
    }
}
