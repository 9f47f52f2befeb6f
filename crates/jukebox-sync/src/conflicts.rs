//! # Conflict Auditing
//!
//! Wraps the pure [`ConflictResolver`] with the audit write.
//!
//! Every resolution other than "no conflict" is appended to
//! `conflict_logs` before it is returned. A failed audit write fails the
//! resolution, and with it the change being pulled.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use jukebox_core::{ChangeRecord, ConflictRecord, ConflictResolver, Resolution};
use jukebox_db::ConflictLogRepository;

use crate::error::SyncResult;

/// Resolves conflicting changes and records the outcome.
#[derive(Debug, Clone)]
pub struct ConflictAuditor {
    log: ConflictLogRepository,
}

impl ConflictAuditor {
    pub fn new(log: ConflictLogRepository) -> Self {
        ConflictAuditor { log }
    }

    /// Resolves `local` against `remote`.
    ///
    /// ## Returns
    /// `None` when the pair is not a conflict (different keys, or a
    /// combination that needs no arbitration).
    ///
    /// ## Errors
    /// Storage errors from the audit write.
    pub async fn resolve(
        &self,
        local: &ChangeRecord,
        remote: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<Resolution>> {
        let Some(resolution) = ConflictResolver::resolve(local, remote) else {
            return Ok(None);
        };

        info!(
            table = %local.entity_table,
            entity_id = %local.entity_id,
            kind = %resolution.kind,
            action = %resolution.action,
            "Conflict resolved"
        );

        self.audit(local, remote, &resolution, now).await?;
        Ok(Some(resolution))
    }

    async fn audit(
        &self,
        local: &ChangeRecord,
        remote: &ChangeRecord,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            conflict_kind: resolution.kind,
            local_change: local.clone(),
            remote_change: remote.clone(),
            resolution: resolution.action,
            reason: resolution.reason.clone(),
            resolved_at: now,
        };

        self.log.insert(&record).await?;
        Ok(())
    }
}
