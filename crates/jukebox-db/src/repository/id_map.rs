//! # Replica Id Map
//!
//! Primary-side record of which local row a replica-created entity became.
//!
//! ```text
//! replica-a pushes  create artists "c-7"  ──► stored as "p-42"
//!                                             sync_id_map(replica-a, artists, c-7) = p-42
//! replica-a pushes  create albums  {artist_id: "c-7"}  ──► artist_id = "p-42"
//! replica-a pushes  update artists "c-7"               ──► updates "p-42"
//! ```
//!
//! Entries are scoped by node, so two replicas may reuse the same client id.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use jukebox_core::CatalogTable;

use crate::error::DbResult;

/// Local id a node's client id was stored under.
pub async fn lookup_on(
    conn: &mut SqliteConnection,
    node_id: &str,
    table: CatalogTable,
    client_id: &str,
) -> DbResult<Option<String>> {
    let primary_id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT primary_id FROM sync_id_map
        WHERE node_id = ?1 AND entity_table = ?2 AND client_id = ?3
        "#,
    )
    .bind(node_id)
    .bind(table)
    .bind(client_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(primary_id)
}

/// Remembers that a node's client id was stored as `primary_id`.
/// A later create with the same client id replaces the entry.
pub async fn remember_on(
    conn: &mut SqliteConnection,
    node_id: &str,
    table: CatalogTable,
    client_id: &str,
    primary_id: &str,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_id_map (node_id, entity_table, client_id, primary_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (node_id, entity_table, client_id) DO UPDATE SET
            primary_id = excluded.primary_id,
            created_at = excluded.created_at
        "#,
    )
    .bind(node_id)
    .bind(table)
    .bind(client_id)
    .bind(primary_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Repository view of the id map.
#[derive(Debug, Clone)]
pub struct IdMapRepository {
    pool: SqlitePool,
}

impl IdMapRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdMapRepository { pool }
    }

    pub async fn lookup(
        &self,
        node_id: &str,
        table: CatalogTable,
        client_id: &str,
    ) -> DbResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        lookup_on(&mut conn, node_id, table, client_id).await
    }

    /// Number of entries held for one node.
    pub async fn count_for_node(&self, node_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_id_map WHERE node_id = ?1")
            .bind(node_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_entries_are_scoped_by_node() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();

        let mut conn = db.pool().acquire().await.unwrap();
        remember_on(&mut conn, "replica-a", CatalogTable::Artists, "c-1", "p-1", now)
            .await
            .unwrap();
        remember_on(&mut conn, "replica-b", CatalogTable::Artists, "c-1", "p-2", now)
            .await
            .unwrap();
        remember_on(&mut conn, "replica-a", CatalogTable::Artists, "c-1", "p-3", now)
            .await
            .unwrap();
        drop(conn);

        let map = db.id_map();
        assert_eq!(
            map.lookup("replica-a", CatalogTable::Artists, "c-1").await.unwrap().as_deref(),
            Some("p-3")
        );
        assert_eq!(
            map.lookup("replica-b", CatalogTable::Artists, "c-1").await.unwrap().as_deref(),
            Some("p-2")
        );
        assert_eq!(map.lookup("replica-a", CatalogTable::Albums, "c-1").await.unwrap(), None);
        assert_eq!(map.count_for_node("replica-a").await.unwrap(), 1);
    }
}
