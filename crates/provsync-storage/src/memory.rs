//! In-process record store, used when no database is configured and in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use provsync_core::{AttemptRecord, AuditEntry, RecordKind, StoredRecord};
use tokio::sync::Mutex;

use crate::records::{EnrichmentCandidate, RecordOp, RecordStore, SnapshotState, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    records: BTreeMap<String, StoredRecord>,
    attempts: BTreeMap<String, AttemptRecord>,
    snapshots: BTreeMap<String, SnapshotState>,
    audit: Vec<AuditEntry>,
}

impl MemoryState {
    fn apply_op(&mut self, op: RecordOp) {
        match op {
            RecordOp::Upsert(record) => {
                self.records.insert(record.external_id.clone(), record);
            }
            RecordOp::Deactivate { external_id, at } => {
                if let Some(record) = self.records.get_mut(&external_id) {
                    record.active = false;
                    record.updated_at = at;
                }
            }
            RecordOp::Audit(entry) => self.audit.push(entry),
            RecordOp::Attempt(attempt) => {
                self.attempts.insert(attempt.external_id.clone(), attempt);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
    fail_after_ops: Mutex<Option<usize>>,
    unavailable: AtomicBool,
    apply_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `apply` fails after `ops` ops have been staged, simulating a crash mid-transaction.
    pub async fn fail_next_apply_after(&self, ops: usize) {
        *self.fail_after_ops.lock().await = Some(ops);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub async fn all_records(&self) -> Vec<StoredRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn attempt(&self, external_id: &str) -> Option<AttemptRecord> {
        self.state.lock().await.attempts.get(external_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn apply(&self, ops: Vec<RecordOp>) -> Result<(), StoreError> {
        self.check_available()?;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let fail_after = self.fail_after_ops.lock().await.take();

        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        for (index, op) in ops.into_iter().enumerate() {
            if fail_after == Some(index) {
                return Err(StoreError::Unavailable(format!(
                    "injected failure after {index} staged ops"
                )));
            }
            staged.apply_op(op);
        }
        *state = staged;
        Ok(())
    }

    async fn get_records(&self, external_ids: &[String]) -> Result<Vec<StoredRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(external_ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn enrichment_candidates(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<EnrichmentCandidate>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.active && r.record_kind == kind)
            .map(|record| EnrichmentCandidate {
                record: record.clone(),
                attempt: state.attempts.get(&record.external_id).cloned(),
            })
            .collect())
    }

    async fn last_snapshot(&self, source_id: &str) -> Result<Option<SnapshotState>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.snapshots.get(source_id).cloned())
    }

    async fn commit_snapshot(&self, snapshot: SnapshotState) -> Result<(), StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .snapshots
            .insert(snapshot.snapshot.source_id.clone(), snapshot);
        Ok(())
    }

    async fn audit_log(&self, external_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|e| e.external_id == external_id)
            .cloned()
            .collect())
    }
}
