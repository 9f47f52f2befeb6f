//! # Database Migrations
//!
//! Embedded SQL migrations, applied on startup.
//!
//! ## Directory Structure
//! ```text
//! migrations/sqlite/
//! ├── 001_catalog.sql       # genres, artists, albums, songs, playlists
//! ├── 002_sync_engine.sql   # change log, acks, tracking, conflicts, keys, settings
//! └── 003_id_map_and_rejections.sql   # replica id map, push rejections
//! ```

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

/// Embedded migrations from the workspace `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// Idempotent: each migration is recorded in `_sqlx_migrations` and runs
/// once, in filename order.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns `(total_migrations, applied_migrations)` for diagnostics.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}
