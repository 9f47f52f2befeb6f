//! # Core Types
//!
//! The replicated catalog and the change records that describe mutations
//! to it.
//!
//! ## Catalog Dependency Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   genres ──┐                                                            │
//! │            │                                                            │
//! │   artists ─┼──► albums ──► songs        playlists (standalone)          │
//! │            │                 ▲                                          │
//! │            └─────────────────┘                                          │
//! │                                                                         │
//! │   Bootstrap inserts left to right and clears right to left, so every   │
//! │   foreign key points at a row that already exists.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Catalog Table
// =============================================================================

/// One of the replicated catalog tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum CatalogTable {
    Genres,
    Artists,
    Albums,
    Songs,
    Playlists,
}

/// Columns every catalog table carries besides its payload columns.
/// Stripped from payloads whenever a record is re-created or merged.
pub const SYSTEM_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

impl CatalogTable {
    /// All tables in dependency order (parents before children).
    pub const DEPENDENCY_ORDER: [CatalogTable; 5] = [
        CatalogTable::Genres,
        CatalogTable::Artists,
        CatalogTable::Albums,
        CatalogTable::Songs,
        CatalogTable::Playlists,
    ];

    /// Table name as stored in SQLite and sent on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CatalogTable::Genres => "genres",
            CatalogTable::Artists => "artists",
            CatalogTable::Albums => "albums",
            CatalogTable::Songs => "songs",
            CatalogTable::Playlists => "playlists",
        }
    }

    /// Payload columns a change may set. Anything else in a payload is ignored.
    pub const fn columns(&self) -> &'static [&'static str] {
        match self {
            CatalogTable::Genres => &["name", "description", "color"],
            CatalogTable::Artists => &[
                "name",
                "biography",
                "country",
                "formed_year",
                "website",
                "image_url",
            ],
            CatalogTable::Albums => &[
                "title",
                "artist_id",
                "release_date",
                "description",
                "cover_image_url",
                "total_tracks",
                "duration",
            ],
            CatalogTable::Songs => &[
                "title",
                "album_id",
                "artist_id",
                "genre_id",
                "track_number",
                "duration",
                "file_format",
                "file_size",
            ],
            CatalogTable::Playlists => &["name", "description", "is_public"],
        }
    }

    /// Foreign-key columns and the table each one references.
    pub const fn foreign_keys(&self) -> &'static [(&'static str, CatalogTable)] {
        match self {
            CatalogTable::Albums => &[("artist_id", CatalogTable::Artists)],
            CatalogTable::Songs => &[
                ("album_id", CatalogTable::Albums),
                ("artist_id", CatalogTable::Artists),
                ("genre_id", CatalogTable::Genres),
            ],
            _ => &[],
        }
    }

    /// Keeps only the payload columns this table knows about.
    pub fn filter_payload(&self, payload: &Map<String, Value>) -> Map<String, Value> {
        payload
            .iter()
            .filter(|(key, _)| self.columns().contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl fmt::Display for CatalogTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CatalogTable::DEPENDENCY_ORDER
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTable(s.to_string()))
    }
}

// =============================================================================
// Change Kind
// =============================================================================

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(CoreError::UnknownChangeKind(other.to_string())),
        }
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// One entry in the append-only change log.
///
/// ## Lifecycle
/// ```text
/// collaborator mutation ──► record() ──► ChangeRecord { applied_by: {} }
///                                              │
///                 target confirms ─────────────┤ mark_applied_by_target(t)
///                                              ▼
///                                  ChangeRecord { applied_by: {t} }
/// ```
///
/// Everything except `applied_by` is immutable once written, and
/// `applied_by` only ever grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Catalog table of the mutated entity.
    pub entity_table: CatalogTable,

    /// Id of the mutated entity.
    pub entity_id: String,

    /// Create, update or delete.
    pub change_kind: ChangeKind,

    /// Full entity attributes. `None` for deletes.
    pub payload: Option<Value>,

    /// When the mutation was recorded. Orders changes per entity.
    pub created_at: DateTime<Utc>,

    /// Targets that have confirmed this change.
    pub applied_by: BTreeSet<String>,
}

impl ChangeRecord {
    /// Returns true if the given target has confirmed this change.
    pub fn is_applied_by(&self, target_id: &str) -> bool {
        self.applied_by.contains(target_id)
    }

    /// Returns true if both records refer to the same entity.
    pub fn same_entity(&self, other: &ChangeRecord) -> bool {
        self.entity_table == other.entity_table && self.entity_id == other.entity_id
    }

    /// Payload as a JSON object, if it is one.
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_ref().and_then(Value::as_object)
    }
}

/// Input for appending to the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_table: CatalogTable,
    pub entity_id: String,
    pub change_kind: ChangeKind,
    pub payload: Option<Value>,
}

impl NewChange {
    pub fn create(table: CatalogTable, entity_id: impl Into<String>, payload: Value) -> Self {
        NewChange {
            entity_table: table,
            entity_id: entity_id.into(),
            change_kind: ChangeKind::Create,
            payload: Some(payload),
        }
    }

    pub fn update(table: CatalogTable, entity_id: impl Into<String>, payload: Value) -> Self {
        NewChange {
            entity_table: table,
            entity_id: entity_id.into(),
            change_kind: ChangeKind::Update,
            payload: Some(payload),
        }
    }

    pub fn delete(table: CatalogTable, entity_id: impl Into<String>) -> Self {
        NewChange {
            entity_table: table,
            entity_id: entity_id.into(),
            change_kind: ChangeKind::Delete,
            payload: None,
        }
    }

    /// Materializes the record as `ChangeLog.record` would store it.
    pub fn into_record(self, id: String, created_at: DateTime<Utc>) -> ChangeRecord {
        // Deletes never carry a payload.
        let payload = match self.change_kind {
            ChangeKind::Delete => None,
            _ => self.payload,
        };

        ChangeRecord {
            id,
            entity_table: self.entity_table,
            entity_id: self.entity_id,
            change_kind: self.change_kind,
            payload,
            created_at,
            applied_by: BTreeSet::new(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
