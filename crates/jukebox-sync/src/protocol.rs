//! # Sync Protocol Messages
//!
//! JSON bodies exchanged between a replica and its primary.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  PULL (PRIMARY → REPLICA)                                              │
//! │  ────────────────────────                                              │
//! │  REPLICA ───► GET /sync/changes?since=<RFC 3339>                       │
//! │  PRIMARY ◄─── ChangesResponse { changes, count, since, current_time }  │
//! │  REPLICA ───► POST /sync/ack AckRequest { change_ids }                 │
//! │  PRIMARY ◄─── AckResponse { acknowledged }                             │
//! │                                                                         │
//! │  PUSH (REPLICA → PRIMARY)                                              │
//! │  ────────────────────────                                              │
//! │  REPLICA ───► POST /sync/apply ApplyRequest { changes }                │
//! │  PRIMARY ◄─── ApplyResponse { applied_count, error_count, errors,      │
//! │                               applied_ids }                            │
//! │                                                                         │
//! │  BOOTSTRAP                                                             │
//! │  ─────────                                                             │
//! │  REPLICA ───► GET /sync/initial_data                                   │
//! │  PRIMARY ◄─── InitialDataResponse { clear_existing, genres, ... }      │
//! │                                                                         │
//! │  Every /sync/* request carries X-Node-ID and X-Signature headers.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use ts_rs::TS;

use jukebox_core::{CatalogTable, ChangeKind, ChangeRecord};
use jukebox_db::Row;

use crate::error::{SyncError, SyncResult};

/// Header carrying the caller's node id.
pub const NODE_ID_HEADER: &str = "x-node-id";

/// Header carrying the caller's shared secret.
pub const SIGNATURE_HEADER: &str = "x-signature";

pub const CHANGES_PATH: &str = "/sync/changes";
pub const APPLY_PATH: &str = "/sync/apply";
pub const ACK_PATH: &str = "/sync/ack";
pub const STATUS_PATH: &str = "/sync/status";
pub const INITIAL_DATA_PATH: &str = "/sync/initial_data";
pub const HEALTH_PATH: &str = "/health";

// =============================================================================
// Pull
// =============================================================================

/// A change as served by `GET /sync/changes`.
///
/// `table` and `type` stay strings on the wire so that one unknown value
/// fails only its own record, not the whole page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChange {
    pub id: String,
    pub table: String,
    pub record_id: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeRecord> for WireChange {
    fn from(change: &ChangeRecord) -> Self {
        WireChange {
            id: change.id.clone(),
            table: change.entity_table.to_string(),
            record_id: change.entity_id.clone(),
            change_type: change.change_kind.to_string(),
            data: change.payload.clone(),
            timestamp: change.created_at,
        }
    }
}

impl WireChange {
    /// Converts a served change back into a record. The record's
    /// `applied_by` set starts empty: it is the remote node's bookkeeping.
    pub fn to_record(&self) -> SyncResult<ChangeRecord> {
        let entity_table: CatalogTable = self
            .table
            .parse()
            .map_err(|e: jukebox_core::CoreError| SyncError::InvalidMessage(e.to_string()))?;
        let change_kind: ChangeKind = self
            .change_type
            .parse()
            .map_err(|e: jukebox_core::CoreError| SyncError::InvalidMessage(e.to_string()))?;

        Ok(ChangeRecord {
            id: self.id.clone(),
            entity_table,
            entity_id: self.record_id.clone(),
            change_kind,
            payload: if change_kind == ChangeKind::Delete {
                None
            } else {
                self.data.clone()
            },
            created_at: self.timestamp,
            applied_by: BTreeSet::new(),
        })
    }
}

/// Query string of `GET /sync/changes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: Option<String>,
}

/// Body of `GET /sync/changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub changes: Vec<WireChange>,
    pub count: usize,
    /// The lower bound the primary actually used.
    pub since: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
}

/// Body of `POST /sync/ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRequest {
    pub change_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Ids newly acknowledged for the caller.
    pub acknowledged: usize,
}

// =============================================================================
// Push
// =============================================================================

/// A change pushed by a replica. `id` is the replica's change id and is
/// echoed back in `applied_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedChange {
    #[serde(default)]
    pub id: Option<String>,
    pub table: String,
    pub record_id: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<&ChangeRecord> for PushedChange {
    fn from(change: &ChangeRecord) -> Self {
        PushedChange {
            id: Some(change.id.clone()),
            table: change.entity_table.to_string(),
            record_id: change.entity_id.clone(),
            change_type: change.change_kind.to_string(),
            data: change.payload.clone(),
        }
    }
}

impl PushedChange {
    /// Converts to a [`ChangeRecord`] stamped with the receiver's clock.
    ///
    /// A missing id gets a fresh one; it is only used for logging.
    pub fn to_record(&self, now: DateTime<Utc>) -> SyncResult<ChangeRecord> {
        let entity_table: CatalogTable = self
            .table
            .parse()
            .map_err(|e: jukebox_core::CoreError| SyncError::InvalidMessage(e.to_string()))?;
        let change_kind: ChangeKind = self
            .change_type
            .parse()
            .map_err(|e: jukebox_core::CoreError| SyncError::InvalidMessage(e.to_string()))?;

        Ok(ChangeRecord {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            entity_table,
            entity_id: self.record_id.clone(),
            change_kind,
            payload: if change_kind == ChangeKind::Delete {
                None
            } else {
                self.data.clone()
            },
            created_at: now,
            applied_by: BTreeSet::new(),
        })
    }
}

/// Body of `POST /sync/apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub changes: Vec<PushedChange>,
}

/// One rejected change in an apply batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyErrorEntry {
    pub change: PushedChange,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub applied_count: usize,
    pub error_count: usize,
    #[serde(default)]
    pub errors: Vec<ApplyErrorEntry>,
    /// Replica change ids that were applied (or were harmless no-ops).
    #[serde(default)]
    pub applied_ids: Vec<String>,
}

// =============================================================================
// Status & Bootstrap
// =============================================================================

/// Body of `GET /sync/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StatusResponse {
    pub node_id: String,
    pub role: String,
    pub sync_enabled: bool,
    #[ts(as = "Option<String>")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Changes in the primary's log.
    pub total_changes: i64,
    /// Changes the caller has not acknowledged yet.
    pub pending_for_caller: i64,
    pub healthy: bool,
    #[ts(as = "String")]
    pub current_time: DateTime<Utc>,
}

/// Body of `GET /sync/initial_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialDataResponse {
    pub clear_existing: bool,
    #[serde(default)]
    pub genres: Vec<Row>,
    #[serde(default)]
    pub artists: Vec<Row>,
    #[serde(default)]
    pub albums: Vec<Row>,
    #[serde(default)]
    pub songs: Vec<Row>,
    #[serde(default)]
    pub playlists: Vec<Row>,
    pub total_records: usize,
    pub exported_at: DateTime<Utc>,
}

impl InitialDataResponse {
    pub fn new(exported_at: DateTime<Utc>) -> Self {
        InitialDataResponse {
            clear_existing: true,
            genres: Vec::new(),
            artists: Vec::new(),
            albums: Vec::new(),
            songs: Vec::new(),
            playlists: Vec::new(),
            total_records: 0,
            exported_at,
        }
    }

    pub fn records(&self, table: CatalogTable) -> &[Row] {
        match table {
            CatalogTable::Genres => &self.genres,
            CatalogTable::Artists => &self.artists,
            CatalogTable::Albums => &self.albums,
            CatalogTable::Songs => &self.songs,
            CatalogTable::Playlists => &self.playlists,
        }
    }

    pub fn set_records(&mut self, table: CatalogTable, rows: Vec<Row>) {
        let slot = match table {
            CatalogTable::Genres => &mut self.genres,
            CatalogTable::Artists => &mut self.artists,
            CatalogTable::Albums => &mut self.albums,
            CatalogTable::Songs => &mut self.songs,
            CatalogTable::Playlists => &mut self.playlists,
        };
        *slot = rows;
        self.total_records = CatalogTable::DEPENDENCY_ORDER
            .iter()
            .map(|t| self.records(*t).len())
            .sum();
    }
}

/// JSON error body returned by the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
