//! Durable record storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provsync_core::{AttemptRecord, AuditEntry, RecordKind, Row, SourceSnapshot, StoredRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value for {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// A single mutation; a batch of ops is applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
    Upsert(StoredRecord),
    Deactivate {
        external_id: String,
        at: DateTime<Utc>,
    },
    Audit(AuditEntry),
    Attempt(AttemptRecord),
}

/// Last committed fingerprint and the row set it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub snapshot: SourceSnapshot,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentCandidate {
    pub record: StoredRecord,
    pub attempt: Option<AttemptRecord>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply every op in one transaction, or none of them.
    async fn apply(&self, ops: Vec<RecordOp>) -> Result<(), StoreError>;

    async fn get_records(&self, external_ids: &[String]) -> Result<Vec<StoredRecord>, StoreError>;

    /// Active records of a kind together with their enrichment attempt bookkeeping.
    async fn enrichment_candidates(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<EnrichmentCandidate>, StoreError>;

    async fn last_snapshot(&self, source_id: &str) -> Result<Option<SnapshotState>, StoreError>;

    async fn commit_snapshot(&self, state: SnapshotState) -> Result<(), StoreError>;

    async fn audit_log(&self, external_id: &str) -> Result<Vec<AuditEntry>, StoreError>;
}
