//! # Sync Status Repository
//!
//! Persists [`SyncTargetState`] rows. Transition rules live in
//! `jukebox-core`; this repository loads a row, lets the core type decide,
//! and writes the result back.
//!
//! ## In-Flight Guard
//! ```text
//! scheduled tick ─┐                         ┌─► UPDATE ... WHERE status = 'failed'
//!                 ├─► begin_attempt(t) ─────┤     rows_affected = 1  → Some(state)
//! force_sync ─────┘                         └─► UPDATE ... WHERE status = 'failed'
//!                                                 rows_affected = 0  → None (skip)
//! ```
//! Starting an attempt is a compare-and-set on `status`, so two tasks can
//! never both own the same target.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use jukebox_core::{SyncTargetState, SyncType, TargetStatus};

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    sync_type: SyncType,
    target_id: String,
    status: TargetStatus,
    attempt_count: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for SyncTargetState {
    type Error = DbError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        let metadata: Option<Value> = row
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DbError::corrupt("sync_status_tracking.metadata", e))?;

        Ok(SyncTargetState {
            sync_type: row.sync_type,
            target_id: row.target_id,
            status: row.status,
            attempt_count: row.attempt_count,
            last_attempt_at: row.last_attempt_at,
            last_success_at: row.last_success_at,
            next_attempt_at: row.next_attempt_at,
            error_message: row.error_message,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_STATUS: &str = r#"
    SELECT sync_type, target_id, status, attempt_count,
           last_attempt_at, last_success_at, next_attempt_at,
           error_message, metadata, created_at, updated_at
    FROM sync_status_tracking
"#;

/// Repository for per-target sync state.
#[derive(Debug, Clone)]
pub struct SyncStatusRepository {
    pool: SqlitePool,
}

impl SyncStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncStatusRepository { pool }
    }

    /// Loads a target's state.
    pub async fn get(&self, sync_type: SyncType, target_id: &str) -> DbResult<Option<SyncTargetState>> {
        let row: Option<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE sync_type = ?1 AND target_id = ?2"
        ))
        .bind(sync_type)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncTargetState::try_from).transpose()
    }

    /// Loads a target's state, creating an idle row on first use.
    pub async fn find_or_create(
        &self,
        sync_type: SyncType,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<SyncTargetState> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sync_status_tracking
                (sync_type, target_id, status, attempt_count, created_at, updated_at)
            VALUES (?1, ?2, 'idle', 0, ?3, ?3)
            "#,
        )
        .bind(sync_type)
        .bind(target_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(sync_type, target_id)
            .await?
            .ok_or_else(|| DbError::not_found("SyncTargetState", format!("{sync_type}/{target_id}")))
    }

    /// Moves a target to `in_progress`.
    ///
    /// ## Returns
    /// * `Some(state)` - this caller owns the attempt
    /// * `None` - an attempt is already in flight (not an error)
    pub async fn begin_attempt(
        &self,
        sync_type: SyncType,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<SyncTargetState>> {
        let mut state = self.find_or_create(sync_type, target_id, now).await?;
        let previous = state.status;

        if let Err(e) = state.mark_in_progress(now) {
            if e.is_in_flight() {
                debug!(sync_type = %sync_type, target_id = %target_id, "Attempt already in flight");
                return Ok(None);
            }
            return Err(e.into());
        }

        let result = sqlx::query(
            r#"
            UPDATE sync_status_tracking SET
                status = ?1,
                attempt_count = ?2,
                last_attempt_at = ?3,
                updated_at = ?3
            WHERE sync_type = ?4 AND target_id = ?5 AND status = ?6
            "#,
        )
        .bind(state.status)
        .bind(state.attempt_count)
        .bind(now)
        .bind(sync_type)
        .bind(target_id)
        .bind(previous)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(sync_type = %sync_type, target_id = %target_id, "Lost race to start attempt");
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Writes a state back after `mark_successful` / `mark_failed`.
    pub async fn save(&self, state: &SyncTargetState) -> DbResult<()> {
        let metadata = state.metadata.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sync_status_tracking SET
                status = ?1,
                attempt_count = ?2,
                last_attempt_at = ?3,
                last_success_at = ?4,
                next_attempt_at = ?5,
                error_message = ?6,
                metadata = ?7,
                updated_at = ?8
            WHERE sync_type = ?9 AND target_id = ?10
            "#,
        )
        .bind(state.status)
        .bind(state.attempt_count)
        .bind(state.last_attempt_at)
        .bind(state.last_success_at)
        .bind(state.next_attempt_at)
        .bind(&state.error_message)
        .bind(metadata)
        .bind(state.updated_at)
        .bind(state.sync_type)
        .bind(&state.target_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(
                "SyncTargetState",
                format!("{}/{}", state.sync_type, state.target_id),
            ));
        }

        Ok(())
    }

    /// All tracked targets.
    pub async fn list(&self) -> DbResult<Vec<SyncTargetState>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} ORDER BY sync_type ASC, target_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncTargetState::try_from).collect()
    }

    /// Failed targets whose last attempt was within the past hour.
    pub async fn recent_failures(&self, now: DateTime<Utc>) -> DbResult<Vec<SyncTargetState>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE status = 'failed' AND last_attempt_at > ?1"
        ))
        .bind(now - Duration::hours(1))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncTargetState::try_from).collect()
    }

    /// Failed targets whose backoff has elapsed.
    pub async fn pending_retries(&self, now: DateTime<Utc>) -> DbResult<Vec<SyncTargetState>> {
        let rows: Vec<StatusRow> = sqlx::query_as(&format!(
            "{SELECT_STATUS} WHERE status = 'failed' AND next_attempt_at <= ?1"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncTargetState::try_from).collect()
    }

    /// Most recent success across all targets.
    pub async fn last_success(&self) -> DbResult<Option<DateTime<Utc>>> {
        let states = self.list().await?;
        Ok(states.iter().filter_map(|s| s.last_success_at).max())
    }

    /// True if any target succeeded within the past hour.
    pub async fn any_healthy(&self, now: DateTime<Utc>) -> DbResult<bool> {
        let states = self.list().await?;
        Ok(states.iter().any(|s| s.is_healthy(now)))
    }

    /// Fails attempts left `in_progress` by a process that died mid-sync.
    ///
    /// ## Returns
    /// Number of recovered targets.
    pub async fn recover_stale(&self, max_age: Duration, now: DateTime<Utc>) -> DbResult<u64> {
        let mut recovered = 0;

        for mut state in self.list().await? {
            let stale = state.status == TargetStatus::InProgress
                && state.last_attempt_at.map_or(true, |at| now - at > max_age);

            if !stale {
                continue;
            }

            warn!(
                sync_type = %state.sync_type,
                target_id = %state.target_id,
                "Recovering abandoned in-progress attempt"
            );
            state.mark_failed(now, "Attempt abandoned: process stopped mid-sync", None)?;
            self.save(&state).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Operator reset of every failed target.
    ///
    /// ## Returns
    /// Number of cleared targets.
    pub async fn clear_failed(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let mut cleared = 0;

        for mut state in self.list().await? {
            if state.status != TargetStatus::Failed {
                continue;
            }
            state.clear_failure(now);
            self.save(&state).await?;
            cleared += 1;
        }

        if cleared > 0 {
            info!(cleared, "Cleared failed sync targets");
        }

        Ok(cleared)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
