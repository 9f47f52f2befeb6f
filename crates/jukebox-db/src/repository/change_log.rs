//! # Change Log Repository
//!
//! Durable, append-only record of every mutation to a replicated entity.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  COLLABORATOR MUTATION (e.g. rename an album)                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. UPDATE albums SET title = ? WHERE id = ?                    │   │
//! │  │  2. INSERT INTO sync_changes (entity_table, entity_id, ...)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SYNC CYCLE (later)                                                    │
//! │  • primary serves changes_since(t, excluding = caller)                 │
//! │  • replica pushes pending_for_target("primary")                        │
//! │  • confirmations land in sync_change_acks (applied_by set)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows in `sync_changes` are never updated. `applied_by` is the set of
//! `sync_change_acks` rows for the change; `INSERT OR IGNORE` on the
//! `(change_id, target_id)` key makes confirmation idempotent.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use jukebox_core::{
    CatalogTable, ChangeKind, ChangeRecord, NewChange, CHANGES_PAGE_SIZE, DEFAULT_LOOKBACK_MINUTES,
    MAX_PUSH_REJECTIONS,
};

use crate::error::{DbError, DbResult};

const SELECT_CHANGES: &str = r#"
    SELECT
        c.id,
        c.entity_table,
        c.entity_id,
        c.change_kind,
        c.payload,
        c.created_at,
        (SELECT json_group_array(a.target_id)
           FROM sync_change_acks a
          WHERE a.change_id = c.id) AS applied_by
    FROM sync_changes c
"#;

#[derive(Debug, sqlx::FromRow)]
struct ChangeRow {
    id: String,
    entity_table: CatalogTable,
    entity_id: String,
    change_kind: ChangeKind,
    payload: Option<String>,
    created_at: DateTime<Utc>,
    applied_by: String,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = DbError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        let payload: Option<serde_json::Value> = row
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DbError::corrupt("sync_changes.payload", e))?;

        let applied_by: BTreeSet<String> = serde_json::from_str(&row.applied_by)
            .map_err(|e| DbError::corrupt("sync_change_acks.target_id", e))?;

        Ok(ChangeRecord {
            id: row.id,
            entity_table: row.entity_table,
            entity_id: row.entity_id,
            change_kind: row.change_kind,
            payload,
            created_at: row.created_at,
            applied_by,
        })
    }
}

fn into_records(rows: Vec<ChangeRow>) -> DbResult<Vec<ChangeRecord>> {
    rows.into_iter().map(ChangeRecord::try_from).collect()
}

// =============================================================================
// Connection-Level Operations
// =============================================================================
// These run on a caller-owned connection so they can share a transaction
// with the catalog mutation they describe.

/// Appends a change on the given connection.
pub async fn record_on(
    conn: &mut SqliteConnection,
    change: NewChange,
    now: DateTime<Utc>,
) -> DbResult<ChangeRecord> {
    let record = change.into_record(Uuid::new_v4().to_string(), now);
    let payload = record
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    debug!(
        change_id = %record.id,
        table = %record.entity_table,
        entity_id = %record.entity_id,
        kind = %record.change_kind,
        "Recording change"
    );

    sqlx::query(
        r#"
        INSERT INTO sync_changes (id, entity_table, entity_id, change_kind, payload, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&record.id)
    .bind(record.entity_table)
    .bind(&record.entity_id)
    .bind(record.change_kind)
    .bind(payload)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}

/// Adds `target_id` to the applied-by set of a change on the given
/// connection.
///
/// Returns `true` if the target was newly added. Unknown change ids are
/// ignored.
pub async fn mark_applied_on(
    conn: &mut SqliteConnection,
    change_id: &str,
    target_id: &str,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO sync_change_acks (change_id, target_id, acked_at)
        SELECT ?1, ?2, ?3
        WHERE EXISTS (SELECT 1 FROM sync_changes WHERE id = ?1)
        "#,
    )
    .bind(change_id)
    .bind(target_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Adds `target_id` to the applied-by set of every change to one entity
/// that the target has not confirmed yet.
///
/// ## Returns
/// Number of newly confirmed changes.
pub async fn mark_key_applied_on(
    conn: &mut SqliteConnection,
    table: CatalogTable,
    entity_id: &str,
    target_id: &str,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO sync_change_acks (change_id, target_id, acked_at)
        SELECT c.id, ?3, ?4
          FROM sync_changes c
         WHERE c.entity_table = ?1 AND c.entity_id = ?2
        "#,
    )
    .bind(table)
    .bind(entity_id)
    .bind(target_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the change log.
#[derive(Debug, Clone)]
pub struct ChangeLogRepository {
    pool: SqlitePool,
}

impl ChangeLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ChangeLogRepository { pool }
    }

    /// Appends a new entry.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let change = NewChange::delete(CatalogTable::Songs, &song_id);
    /// db.change_log().record(change, clock.now()).await?;
    /// ```
    pub async fn record(&self, change: NewChange, now: DateTime<Utc>) -> DbResult<ChangeRecord> {
        let mut conn = self.pool.acquire().await?;
        record_on(&mut conn, change, now).await
    }

    /// Changes created strictly after `since` that `excluding_target` has
    /// not confirmed, oldest first, at most [`CHANGES_PAGE_SIZE`].
    ///
    /// A missing `since` means one hour before `now`.
    pub async fn changes_since(
        &self,
        since: Option<DateTime<Utc>>,
        excluding_target: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<ChangeRecord>> {
        let since = effective_since(since, now);

        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            r#"{SELECT_CHANGES}
            WHERE c.created_at > ?1
              AND NOT EXISTS (
                  SELECT 1 FROM sync_change_acks a
                   WHERE a.change_id = c.id AND a.target_id = ?2)
            ORDER BY c.created_at ASC, c.rowid ASC
            LIMIT ?3
            "#
        ))
        .bind(since)
        .bind(excluding_target)
        .bind(CHANGES_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Confirms a change for a target. Idempotent.
    pub async fn mark_applied_by_target(
        &self,
        change_id: &str,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let added = mark_applied_on(&mut conn, change_id, target_id, now).await?;

        if added {
            debug!(change_id = %change_id, target_id = %target_id, "Change acknowledged");
        }

        Ok(added)
    }

    /// Every change the target has not confirmed, regardless of age,
    /// oldest first.
    pub async fn pending_for_target(
        &self,
        target_id: &str,
        limit: u32,
    ) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            r#"{SELECT_CHANGES}
            WHERE NOT EXISTS (
                  SELECT 1 FROM sync_change_acks a
                   WHERE a.change_id = c.id AND a.target_id = ?1)
            ORDER BY c.created_at ASC, c.rowid ASC
            LIMIT ?2
            "#
        ))
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Changes to push to `target_id`: unconfirmed and not parked.
    ///
    /// Changes the target never rejected come first, so a run of refused
    /// changes at the head of the log cannot hold back newer ones.
    pub async fn pushable_for_target(
        &self,
        target_id: &str,
        limit: u32,
    ) -> DbResult<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            r#"{SELECT_CHANGES}
            LEFT JOIN sync_push_rejections r
              ON r.change_id = c.id AND r.target_id = ?1
            WHERE NOT EXISTS (
                  SELECT 1 FROM sync_change_acks a
                   WHERE a.change_id = c.id AND a.target_id = ?1)
              AND COALESCE(r.attempts, 0) < ?2
            ORDER BY COALESCE(r.attempts, 0) ASC, c.created_at ASC, c.rowid ASC
            LIMIT ?3
            "#
        ))
        .bind(target_id)
        .bind(MAX_PUSH_REJECTIONS)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Counts one more refusal of a change by `target_id`.
    ///
    /// ## Returns
    /// Refusals so far, or `None` for an unknown change.
    pub async fn record_rejection(
        &self,
        change_id: &str,
        target_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO sync_push_rejections (change_id, target_id, attempts, last_error, rejected_at)
            SELECT ?1, ?2, 1, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM sync_changes WHERE id = ?1)
            ON CONFLICT (change_id, target_id) DO UPDATE SET
                attempts = attempts + 1,
                last_error = excluded.last_error,
                rejected_at = excluded.rejected_at
            RETURNING attempts
            "#,
        )
        .bind(change_id)
        .bind(target_id)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempts)
    }

    /// Counts unconfirmed changes the target refused too often to re-send.
    pub async fn count_parked(&self, target_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_push_rejections r
            WHERE r.target_id = ?1
              AND r.attempts >= ?2
              AND NOT EXISTS (
                  SELECT 1 FROM sync_change_acks a
                   WHERE a.change_id = r.change_id AND a.target_id = ?1)
            "#,
        )
        .bind(target_id)
        .bind(MAX_PUSH_REJECTIONS)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Latest change to one entity that the target has not confirmed.
    pub async fn pending_for_key(
        &self,
        table: CatalogTable,
        entity_id: &str,
        target_id: &str,
    ) -> DbResult<Option<ChangeRecord>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!(
            r#"{SELECT_CHANGES}
            WHERE c.entity_table = ?1
              AND c.entity_id = ?2
              AND NOT EXISTS (
                  SELECT 1 FROM sync_change_acks a
                   WHERE a.change_id = c.id AND a.target_id = ?3)
            ORDER BY c.created_at DESC, c.rowid DESC
            LIMIT 1
            "#
        ))
        .bind(table)
        .bind(entity_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChangeRecord::try_from).transpose()
    }

    /// Gets a change by id.
    pub async fn get(&self, change_id: &str) -> DbResult<Option<ChangeRecord>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!("{SELECT_CHANGES} WHERE c.id = ?1"))
            .bind(change_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ChangeRecord::try_from).transpose()
    }

    /// Counts all entries.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_changes")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Counts entries the target has not confirmed.
    pub async fn count_pending(&self, target_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sync_changes c
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_change_acks a
                 WHERE a.change_id = c.id AND a.target_id = ?1)
            "#,
        )
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Retention: deletes entries older than `cutoff` that at least one
    /// target has confirmed.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn purge_acknowledged_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_changes
            WHERE created_at < ?1
              AND EXISTS (SELECT 1 FROM sync_change_acks a WHERE a.change_id = sync_changes.id)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Resolves the lower bound of a change query.
pub fn effective_since(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    since.unwrap_or_else(|| now - Duration::minutes(DEFAULT_LOOKBACK_MINUTES))
}

// =============================================================================
// Unit Tests
// =============================================================================
