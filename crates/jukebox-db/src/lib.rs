//! # jukebox-db: Database Layer for the Jukebox Archive
//!
//! SQLite storage for one node: the catalog tables and the bookkeeping the
//! replication engine needs (change log, acknowledgements, sync status,
//! conflict audit, node keys, runtime flags).
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Jukebox Data Flow                                │
//! │                                                                         │
//! │  jukebox-sync (orchestrator, HTTP server, apply engine)                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     jukebox-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ ChangeLogRepo  │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncStatusRepo │    │ 001_catalog  │  │   │
//! │  │   │ Transactions  │    │ CatalogRepo    │    │ 002_sync     │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jukebox_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("archive.db")).await?;
//!
//! let (row, change) = db
//!     .catalog()
//!     .create(CatalogTable::Genres, &json!({"name": "Jazz"}), Utc::now())
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::catalog::{CatalogRepository, Row};
pub use repository::change_log::{
    effective_since, mark_applied_on, mark_key_applied_on, record_on, ChangeLogRepository,
};
pub use repository::conflict_log::ConflictLogRepository;
pub use repository::id_map::IdMapRepository;
pub use repository::node_key::{NodeKey, NodeKeyRepository};
pub use repository::settings::{SettingsRepository, SYNC_EMERGENCY_STOP, SYNC_ENABLED, SYNC_PAUSED};
pub use repository::status::SyncStatusRepository;
