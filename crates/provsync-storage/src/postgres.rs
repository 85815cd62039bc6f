//! PostgreSQL-backed record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provsync_core::{
    AttemptRecord, AuditEntry, RecordKind, Row, SourceSnapshot, StoredField, StoredRecord,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::info;

use crate::records::{EnrichmentCandidate, RecordOp, RecordStore, SnapshotState, StoreError};

type RecordRow = (
    String,
    String,
    Json<BTreeMap<String, StoredField>>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

type CandidateRow = (
    String,
    String,
    Json<BTreeMap<String, StoredField>>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i32>,
);

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("running provsync migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: RecordRow) -> Result<StoredRecord, StoreError> {
    let (external_id, kind, Json(fields), active, created_at, updated_at) = row;
    let record_kind = RecordKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
        key: external_id.clone(),
        message: format!("unknown record kind {kind}"),
    })?;
    Ok(StoredRecord {
        external_id,
        record_kind,
        fields,
        active,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn apply(&self, ops: Vec<RecordOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for op in ops {
            match op {
                RecordOp::Upsert(record) => {
                    sqlx::query(
                        r#"
                        INSERT INTO provider_records
                            (external_id, record_kind, fields, active, created_at, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (external_id) DO UPDATE
                        SET record_kind = EXCLUDED.record_kind,
                            fields = EXCLUDED.fields,
                            active = EXCLUDED.active,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(&record.external_id)
                    .bind(record.record_kind.as_str())
                    .bind(Json(&record.fields))
                    .bind(record.active)
                    .bind(record.created_at)
                    .bind(record.updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                RecordOp::Deactivate { external_id, at } => {
                    sqlx::query(
                        "UPDATE provider_records SET active = FALSE, updated_at = $2 WHERE external_id = $1",
                    )
                    .bind(&external_id)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                }
                RecordOp::Audit(entry) => {
                    sqlx::query(
                        r#"
                        INSERT INTO merge_audit (external_id, field, entry, recorded_at)
                        VALUES ($1, $2, $3, $4)
                        "#,
                    )
                    .bind(&entry.external_id)
                    .bind(&entry.field)
                    .bind(Json(&entry))
                    .bind(entry.recorded_at)
                    .execute(&mut *tx)
                    .await?;
                }
                RecordOp::Attempt(attempt) => {
                    sqlx::query(
                        r#"
                        INSERT INTO enrichment_attempts (external_id, last_attempt_at, consecutive_failures)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (external_id) DO UPDATE
                        SET last_attempt_at = EXCLUDED.last_attempt_at,
                            consecutive_failures = EXCLUDED.consecutive_failures
                        "#,
                    )
                    .bind(&attempt.external_id)
                    .bind(attempt.last_attempt_at)
                    .bind(i32::try_from(attempt.consecutive_failures).unwrap_or(i32::MAX))
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_records(&self, external_ids: &[String]) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT external_id, record_kind, fields, active, created_at, updated_at
            FROM provider_records
            WHERE external_id = ANY($1)
            ORDER BY external_id
            "#,
        )
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn enrichment_candidates(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<EnrichmentCandidate>, StoreError> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT r.external_id, r.record_kind, r.fields, r.active, r.created_at, r.updated_at,
                   a.last_attempt_at, a.consecutive_failures
            FROM provider_records r
            LEFT JOIN enrichment_attempts a ON a.external_id = r.external_id
            WHERE r.record_kind = $1 AND r.active
            ORDER BY r.external_id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, kind, fields, active, created, updated, last_attempt_at, failures)| {
                let record = record_from_row((id, kind, fields, active, created, updated))?;
                let attempt = (last_attempt_at.is_some() || failures.is_some()).then(|| {
                    AttemptRecord {
                        external_id: record.external_id.clone(),
                        last_attempt_at,
                        consecutive_failures: failures.unwrap_or(0).max(0) as u32,
                    }
                });
                Ok(EnrichmentCandidate { record, attempt })
            })
            .collect()
    }

    async fn last_snapshot(&self, source_id: &str) -> Result<Option<SnapshotState>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>, Json<Vec<Row>>)>(
            "SELECT source_id, fingerprint, observed_at, rows FROM source_snapshots WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(source_id, fingerprint, observed_at, Json(rows))| SnapshotState {
            snapshot: SourceSnapshot {
                source_id,
                fingerprint,
                observed_at,
            },
            rows,
        }))
    }

    async fn commit_snapshot(&self, state: SnapshotState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_snapshots (source_id, fingerprint, observed_at, rows)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id) DO UPDATE
            SET fingerprint = EXCLUDED.fingerprint,
                observed_at = EXCLUDED.observed_at,
                rows = EXCLUDED.rows
            "#,
        )
        .bind(&state.snapshot.source_id)
        .bind(&state.snapshot.fingerprint)
        .bind(state.snapshot.observed_at)
        .bind(Json(&state.rows))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_log(&self, external_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, (Json<AuditEntry>,)>(
            "SELECT entry FROM merge_audit WHERE external_id = $1 ORDER BY id",
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(entry),)| entry).collect())
    }
}
