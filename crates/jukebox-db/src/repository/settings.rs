//! # Settings Repository
//!
//! Key/value runtime settings shared by the admin UI and the sync engine.
//! The orchestrator polls the sync flags once per iteration.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

pub const SYNC_ENABLED: &str = "sync_enabled";
pub const SYNC_PAUSED: &str = "sync_paused";
pub const SYNC_EMERGENCY_STOP: &str = "sync_emergency_stop";

/// Repository for `system_settings`.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SettingsRepository { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(key = %key, value = %value, "Setting updated");
        Ok(())
    }

    /// Reads a boolean flag. Anything but `"true"`/`"1"` counts as false;
    /// a missing key yields `default`.
    pub async fn get_bool(&self, key: &str, default: bool) -> DbResult<bool> {
        Ok(self
            .get(key)
            .await?
            .map(|v| matches!(v.trim(), "true" | "1"))
            .unwrap_or(default))
    }

    pub async fn set_bool(&self, key: &str, value: bool, now: DateTime<Utc>) -> DbResult<()> {
        self.set(key, if value { "true" } else { "false" }, now).await
    }
}
