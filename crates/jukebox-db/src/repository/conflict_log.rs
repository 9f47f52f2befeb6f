//! # Conflict Log Repository
//!
//! Append-only audit trail of resolved conflicts. Nothing in the engine
//! reads it back; it exists for operators.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jukebox_core::{ConflictKind, ConflictRecord, ResolutionAction};

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: String,
    conflict_kind: ConflictKind,
    local_change: String,
    remote_change: String,
    resolution: ResolutionAction,
    reason: String,
    resolved_at: DateTime<Utc>,
}

impl TryFrom<ConflictRow> for ConflictRecord {
    type Error = DbError;

    fn try_from(row: ConflictRow) -> Result<Self, Self::Error> {
        Ok(ConflictRecord {
            id: row.id,
            conflict_kind: row.conflict_kind,
            local_change: serde_json::from_str(&row.local_change)
                .map_err(|e| DbError::corrupt("conflict_logs.local_change", e))?,
            remote_change: serde_json::from_str(&row.remote_change)
                .map_err(|e| DbError::corrupt("conflict_logs.remote_change", e))?,
            resolution: row.resolution,
            reason: row.reason,
            resolved_at: row.resolved_at,
        })
    }
}

/// Repository for the conflict audit trail.
#[derive(Debug, Clone)]
pub struct ConflictLogRepository {
    pool: SqlitePool,
}

impl ConflictLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictLogRepository { pool }
    }

    /// Appends an audit row.
    pub async fn insert(&self, record: &ConflictRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_logs
                (id, conflict_kind, local_change, remote_change, resolution, reason, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.id)
        .bind(record.conflict_kind)
        .bind(serde_json::to_string(&record.local_change)?)
        .bind(serde_json::to_string(&record.remote_change)?)
        .bind(record.resolution)
        .bind(&record.reason)
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent audit rows first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(
            r#"
            SELECT id, conflict_kind, local_change, remote_change, resolution, reason, resolved_at
            FROM conflict_logs
            ORDER BY resolved_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_logs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
