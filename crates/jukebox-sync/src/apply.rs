//! # Apply Engine
//!
//! Applies one resolved change to local catalog storage.
//!
//! ## Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Applying a ChangeRecord                          │
//! │                                                                         │
//! │  CREATE                                                                │
//! │  • Preserve: insert under the change's entity id; if the row is        │
//! │    already there (re-delivery), merge the payload instead              │
//! │  • Reassign: insert under a fresh id, ignoring supplied id and         │
//! │    timestamps; remember old id → new id for later records              │
//! │                                                                         │
//! │  UPDATE                                                                │
//! │  • merge payload columns into the row found by id                      │
//! │  • row missing → Skipped (a delete already won)                        │
//! │                                                                         │
//! │  DELETE                                                                │
//! │  • remove the row if present, Skipped otherwise                        │
//! │                                                                         │
//! │  Foreign-key columns whose value was reassigned earlier in the same    │
//! │  engine are rewritten before writing.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An engine built with [`ApplyEngine::for_node`] also persists every
//! reassignment in `sync_id_map` and consults it, so ids a replica pushed
//! in an earlier request still resolve for updates, deletes and children.
//!
//! The engine never touches the change log; callers decide whether an
//! applied change is recorded (primary) or not (replica).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use jukebox_core::{CatalogTable, ChangeKind, ChangeRecord};
use jukebox_db::repository::{catalog, id_map};
use jukebox_db::{DbError, Row};

use crate::error::{SyncError, SyncResult};

/// What happens to the id of a created record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPolicy {
    /// Keep the change's entity id.
    Preserve,
    /// Generate a new id; the supplied one is only used for remapping.
    Reassign,
}

/// Result of applying one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created { entity_id: String },
    Updated { entity_id: String },
    Deleted { entity_id: String },
    Skipped { reason: String },
}

impl ApplyOutcome {
    /// The local entity that changed, and how.
    pub fn changed(&self) -> Option<(&str, ChangeKind)> {
        match self {
            ApplyOutcome::Created { entity_id } => Some((entity_id, ChangeKind::Create)),
            ApplyOutcome::Updated { entity_id } => Some((entity_id, ChangeKind::Update)),
            ApplyOutcome::Deleted { entity_id } => Some((entity_id, ChangeKind::Delete)),
            ApplyOutcome::Skipped { .. } => None,
        }
    }
}

/// Applies changes on a caller-supplied connection or transaction.
#[derive(Debug)]
pub struct ApplyEngine {
    policy: IdPolicy,
    /// Node whose reassigned ids are persisted.
    node_scope: Option<String>,
    id_map: HashMap<(CatalogTable, String), String>,
}

impl ApplyEngine {
    pub fn new(policy: IdPolicy) -> Self {
        ApplyEngine {
            policy,
            node_scope: None,
            id_map: HashMap::new(),
        }
    }

    /// Reassigning engine for changes pushed by `node_id`.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        ApplyEngine {
            policy: IdPolicy::Reassign,
            node_scope: Some(node_id.into()),
            id_map: HashMap::new(),
        }
    }

    /// Local id an incoming id was reassigned to, if any.
    pub fn mapped_id(&self, table: CatalogTable, id: &str) -> Option<&str> {
        self.id_map.get(&(table, id.to_string())).map(String::as_str)
    }

    /// Applies one change.
    ///
    /// ## Errors
    /// A missing payload on create/update, or any storage failure (unique
    /// or foreign-key violation) is returned as [`SyncError::ApplyFailed`];
    /// the caller collects it and moves on to the next record.
    pub async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        change: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> SyncResult<ApplyOutcome> {
        let table = change.entity_table;

        debug!(
            change_id = %change.id,
            table = %table,
            entity_id = %change.entity_id,
            kind = %change.change_kind,
            "Applying change"
        );

        match change.change_kind {
            ChangeKind::Create => {
                let fields = self.prepare_fields(conn, change).await?;
                match self.policy {
                    IdPolicy::Reassign => {
                        let entity_id = self
                            .insert_reassigned(conn, table, &change.entity_id, &fields, now)
                            .await?;
                        Ok(ApplyOutcome::Created { entity_id })
                    }
                    IdPolicy::Preserve => {
                        let id = change.entity_id.clone();
                        let exists = catalog::fetch_row(conn, table, &id)
                            .await
                            .map_err(apply_error)?
                            .is_some();

                        if exists {
                            catalog::update_row(conn, table, &id, &fields, now)
                                .await
                                .map_err(apply_error)?;
                            Ok(ApplyOutcome::Updated { entity_id: id })
                        } else {
                            catalog::insert_row(conn, table, &id, &fields, now)
                                .await
                                .map_err(apply_error)?;
                            Ok(ApplyOutcome::Created { entity_id: id })
                        }
                    }
                }
            }
            ChangeKind::Update => {
                let fields = self.prepare_fields(conn, change).await?;
                let id = self.local_id(conn, table, &change.entity_id).await?;

                if catalog::update_row(conn, table, &id, &fields, now)
                    .await
                    .map_err(apply_error)?
                {
                    Ok(ApplyOutcome::Updated { entity_id: id })
                } else {
                    Ok(ApplyOutcome::Skipped {
                        reason: format!("{} {} no longer exists", table, id),
                    })
                }
            }
            ChangeKind::Delete => {
                let id = self.local_id(conn, table, &change.entity_id).await?;

                if catalog::delete_row(conn, table, &id)
                    .await
                    .map_err(apply_error)?
                {
                    Ok(ApplyOutcome::Deleted { entity_id: id })
                } else {
                    Ok(ApplyOutcome::Skipped {
                        reason: format!("{} {} already absent", table, id),
                    })
                }
            }
        }
    }

    /// Inserts one snapshot row under a fresh id, whatever the policy.
    /// Returns the new id.
    pub async fn insert_snapshot_row(
        &mut self,
        conn: &mut SqliteConnection,
        table: CatalogTable,
        row: &Row,
        now: DateTime<Utc>,
    ) -> SyncResult<String> {
        let old_id = row
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let fields = self
            .remap_foreign_keys(conn, table, table.filter_payload(row))
            .await?;

        self.insert_reassigned(conn, table, &old_id, &fields, now).await
    }

    async fn insert_reassigned(
        &mut self,
        conn: &mut SqliteConnection,
        table: CatalogTable,
        old_id: &str,
        fields: &Row,
        now: DateTime<Utc>,
    ) -> SyncResult<String> {
        let new_id = Uuid::new_v4().to_string();

        catalog::insert_row(conn, table, &new_id, fields, now)
            .await
            .map_err(apply_error)?;

        if !old_id.is_empty() {
            if let Some(node_id) = &self.node_scope {
                id_map::remember_on(conn, node_id, table, old_id, &new_id, now)
                    .await
                    .map_err(apply_error)?;
            }
            self.id_map.insert((table, old_id.to_string()), new_id.clone());
        }
        Ok(new_id)
    }

    async fn prepare_fields(
        &mut self,
        conn: &mut SqliteConnection,
        change: &ChangeRecord,
    ) -> SyncResult<Row> {
        let payload = change.payload_object().ok_or_else(|| {
            SyncError::ApplyFailed(format!(
                "{} {} for {} has no payload",
                change.change_kind, change.id, change.entity_table
            ))
        })?;

        let table = change.entity_table;
        self.remap_foreign_keys(conn, table, table.filter_payload(payload))
            .await
    }

    async fn remap_foreign_keys(
        &mut self,
        conn: &mut SqliteConnection,
        table: CatalogTable,
        mut fields: Row,
    ) -> SyncResult<Row> {
        for (column, parent) in table.foreign_keys() {
            let Some(old) = fields.get(*column).and_then(Value::as_str).map(str::to_string) else {
                continue;
            };

            if let Some(new_id) = self.resolve_id(conn, *parent, &old).await? {
                fields.insert((*column).to_string(), Value::String(new_id));
            }
        }
        Ok(fields)
    }

    async fn local_id(
        &mut self,
        conn: &mut SqliteConnection,
        table: CatalogTable,
        id: &str,
    ) -> SyncResult<String> {
        Ok(self
            .resolve_id(conn, table, id)
            .await?
            .unwrap_or_else(|| id.to_string()))
    }

    /// Reassigned id for `id`: this engine's own map first, then the
    /// persisted map of the scoped node.
    async fn resolve_id(
        &mut self,
        conn: &mut SqliteConnection,
        table: CatalogTable,
        id: &str,
    ) -> SyncResult<Option<String>> {
        if let Some(mapped) = self.mapped_id(table, id) {
            return Ok(Some(mapped.to_string()));
        }

        let Some(node_id) = &self.node_scope else {
            return Ok(None);
        };
        let stored = id_map::lookup_on(conn, node_id, table, id)
            .await
            .map_err(apply_error)?;

        if let Some(primary_id) = &stored {
            self.id_map.insert((table, id.to_string()), primary_id.clone());
        }
        Ok(stored)
    }
}

fn apply_error(err: DbError) -> SyncError {
    SyncError::ApplyFailed(err.to_string())
}
