//! # Repository Module
//!
//! Database repositories for a jukebox node.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Sync engine / collaborator                                            │
//! │       │                                                                 │
//! │       │  db.change_log().changes_since(t, Some("replica-a"), now)      │
//! │       ▼                                                                 │
//! │  ChangeLogRepository (holds a SqlitePool clone)                        │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Operations that must share a transaction with a catalog write         │
//! │  (record_on, mark_applied_on, insert_row, ...) take a                  │
//! │  `&mut SqliteConnection` instead of going through a repository.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`catalog::CatalogRepository`] - Catalog rows, mutations logged to the outbox
//! - [`change_log::ChangeLogRepository`] - The change log and its acknowledgements
//! - [`status::SyncStatusRepository`] - Per-target sync tracking
//! - [`conflict_log::ConflictLogRepository`] - Conflict audit trail
//! - [`id_map::IdMapRepository`] - Replica ids translated on the primary
//! - [`node_key::NodeKeyRepository`] - Replica credentials
//! - [`settings::SettingsRepository`] - Runtime flags

pub mod catalog;
pub mod change_log;
pub mod conflict_log;
pub mod id_map;
pub mod node_key;
pub mod settings;
pub mod status;
