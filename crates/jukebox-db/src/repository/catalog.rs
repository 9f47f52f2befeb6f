//! # Catalog Repository
//!
//! Row access for the replicated catalog tables.
//!
//! Two layers live here:
//!
//! - **Connection-level functions** (`insert_row`, `update_row`, ...) that
//!   run on a caller's connection or transaction. The apply path uses these
//!   so that applying a change and logging it commit together.
//! - **[`CatalogRepository`]**, the collaborator entry point: every
//!   create/update/delete mutates the row *and* appends to the change log
//!   in one transaction.
//!
//! Rows travel as JSON objects. Only the columns listed by
//! [`CatalogTable::columns`] are ever written; other keys are ignored.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use jukebox_core::{CatalogTable, ChangeRecord, CoreError, NewChange};

use crate::error::{DbError, DbResult};
use crate::repository::change_log;

/// A catalog row as a JSON object.
pub type Row = Map<String, Value>;

// =============================================================================
// SQL Helpers
// =============================================================================

/// `json_object('id', id, ..., 'updated_at', updated_at)` for a table.
fn json_projection(table: CatalogTable) -> String {
    let pairs: Vec<String> = std::iter::once("id")
        .chain(table.columns().iter().copied())
        .chain(["created_at", "updated_at"])
        .map(|column| format!("'{column}', {column}"))
        .collect();

    format!("json_object({})", pairs.join(", "))
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        // Nested structures are stored as their JSON text.
        other => query.bind(other.to_string()),
    }
}

fn parse_row(json: &str) -> DbResult<Row> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::corrupt("json_object", format!("expected object, got {other}"))),
    }
}

// =============================================================================
// Connection-Level Operations
// =============================================================================

/// Loads one row.
pub async fn fetch_row(
    conn: &mut SqliteConnection,
    table: CatalogTable,
    id: &str,
) -> DbResult<Option<Row>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        json_projection(table),
        table.as_str()
    );

    let json: Option<String> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    json.as_deref().map(parse_row).transpose()
}

/// Inserts a row with the given id. Unknown payload keys are ignored.
pub async fn insert_row(
    conn: &mut SqliteConnection,
    table: CatalogTable,
    id: &str,
    fields: &Row,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let fields = table.filter_payload(fields);
    let columns: Vec<&str> = fields.keys().map(String::as_str).collect();

    let mut names = vec!["id"];
    names.extend(&columns);
    names.extend(["created_at", "updated_at"]);
    let placeholders = vec!["?"; names.len()].join(", ");

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.as_str(),
        names.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql).bind(id);
    for value in fields.values() {
        query = bind_json(query, value);
    }
    query.bind(now).bind(now).execute(&mut *conn).await?;

    debug!(table = %table, id = %id, "Inserted catalog row");
    Ok(())
}

/// Merges the given fields into an existing row.
///
/// ## Returns
/// `false` if no row has that id.
pub async fn update_row(
    conn: &mut SqliteConnection,
    table: CatalogTable,
    id: &str,
    fields: &Row,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let fields = table.filter_payload(fields);

    let mut assignments: Vec<String> = fields.keys().map(|c| format!("{c} = ?")).collect();
    assignments.push("updated_at = ?".to_string());

    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?",
        table.as_str(),
        assignments.join(", ")
    );

    let mut query = sqlx::query(&sql);
    for value in fields.values() {
        query = bind_json(query, value);
    }
    let result = query.bind(now).bind(id).execute(&mut *conn).await?;

    Ok(result.rows_affected() > 0)
}

/// Deletes a row.
///
/// ## Returns
/// `false` if no row has that id.
pub async fn delete_row(conn: &mut SqliteConnection, table: CatalogTable, id: &str) -> DbResult<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", table.as_str());
    let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;

    Ok(result.rows_affected() > 0)
}

/// Every row of a table, oldest first.
pub async fn export_table(conn: &mut SqliteConnection, table: CatalogTable) -> DbResult<Vec<Row>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY created_at ASC, rowid ASC",
        json_projection(table),
        table.as_str()
    );

    let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;

    rows.iter().map(|json| parse_row(json)).collect()
}

/// Deletes every row of a table.
pub async fn clear_table(conn: &mut SqliteConnection, table: CatalogTable) -> DbResult<u64> {
    let sql = format!("DELETE FROM {}", table.as_str());
    let result = sqlx::query(&sql).execute(&mut *conn).await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Repository
// =============================================================================

/// Collaborator-facing catalog access. Every mutation is logged.
#[derive(Debug, Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

fn require_object<'a>(
    table: CatalogTable,
    id: &str,
    kind: &str,
    fields: &'a Value,
) -> DbResult<&'a Row> {
    fields.as_object().ok_or_else(|| {
        DbError::Domain(CoreError::MissingPayload {
            table: table.to_string(),
            entity_id: id.to_string(),
            change_kind: kind.to_string(),
        })
    })
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CatalogRepository { pool }
    }

    /// Creates a row and logs a `create` change.
    ///
    /// ## Returns
    /// The stored row and the change record describing it.
    pub async fn create(
        &self,
        table: CatalogTable,
        fields: &Value,
        now: DateTime<Utc>,
    ) -> DbResult<(Row, ChangeRecord)> {
        let id = Uuid::new_v4().to_string();
        let fields = require_object(table, &id, "create", fields)?;

        let mut tx = self.pool.begin().await?;

        insert_row(&mut tx, table, &id, fields, now).await?;
        let row = fetch_row(&mut tx, table, &id)
            .await?
            .ok_or_else(|| DbError::not_found(table.as_str(), &id))?;
        let change = change_log::record_on(
            &mut tx,
            NewChange::create(table, &id, Value::Object(row.clone())),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok((row, change))
    }

    /// Merges fields into a row and logs an `update` change.
    pub async fn update(
        &self,
        table: CatalogTable,
        id: &str,
        fields: &Value,
        now: DateTime<Utc>,
    ) -> DbResult<(Row, ChangeRecord)> {
        let fields = require_object(table, id, "update", fields)?;

        let mut tx = self.pool.begin().await?;

        if !update_row(&mut tx, table, id, fields, now).await? {
            return Err(DbError::not_found(table.as_str(), id));
        }
        let row = fetch_row(&mut tx, table, id)
            .await?
            .ok_or_else(|| DbError::not_found(table.as_str(), id))?;
        let change = change_log::record_on(
            &mut tx,
            NewChange::update(table, id, Value::Object(row.clone())),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok((row, change))
    }

    /// Deletes a row and logs a `delete` change.
    pub async fn delete(&self, table: CatalogTable, id: &str, now: DateTime<Utc>) -> DbResult<ChangeRecord> {
        let mut tx = self.pool.begin().await?;

        if !delete_row(&mut tx, table, id).await? {
            return Err(DbError::not_found(table.as_str(), id));
        }
        let change = change_log::record_on(&mut tx, NewChange::delete(table, id), now).await?;

        tx.commit().await?;
        Ok(change)
    }

    pub async fn get(&self, table: CatalogTable, id: &str) -> DbResult<Option<Row>> {
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, table, id).await
    }

    pub async fn export(&self, table: CatalogTable) -> DbResult<Vec<Row>> {
        let mut conn = self.pool.acquire().await?;
        export_table(&mut conn, table).await
    }

    pub async fn count(&self, table: CatalogTable) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use jukebox_core::ChangeKind;
    use serde_json::json;

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[test]
    fn test_json_projection_lists_every_column() {
        let projection = json_projection(CatalogTable::Genres);
        assert_eq!(
            projection,
            "json_object('id', id, 'name', name, 'description', description, \
             'color', color, 'created_at', created_at, 'updated_at', updated_at)"
        );
    }

    #[tokio::test]
    async fn test_create_logs_change_in_same_transaction() {
        let db = setup().await;
        let now = Utc::now();

        let (row, change) = db
            .catalog()
            .create(CatalogTable::Genres, &json!({"name": "Jazz", "bogus": 1}), now)
            .await
            .unwrap();

        assert_eq!(row["name"], json!("Jazz"));
        assert!(!row.contains_key("bogus"));
        assert_eq!(change.change_kind, ChangeKind::Create);
        assert_eq!(change.entity_id, row["id"].as_str().unwrap());
        assert_eq!(db.change_log().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_logs_nothing() {
        let db = setup().await;
        let now = Utc::now();

        let err = db
            .catalog()
            .create(
                CatalogTable::Albums,
                &json!({"title": "Orphan", "artist_id": "missing"}),
                now,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
        assert_eq!(db.change_log().count().await.unwrap(), 0);
        assert_eq!(db.catalog().count(CatalogTable::Albums).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let db = setup().await;
        let catalog = db.catalog();
        let now = Utc::now();

        let (artist, _) = catalog
            .create(CatalogTable::Artists, &json!({"name": "Miles", "country": "US"}), now)
            .await
            .unwrap();
        let id = artist["id"].as_str().unwrap();

        let (updated, change) = catalog
            .update(CatalogTable::Artists, id, &json!({"formed_year": 1944}), now)
            .await
            .unwrap();
        assert_eq!(updated["country"], json!("US"));
        assert_eq!(updated["formed_year"], json!(1944));
        assert_eq!(change.payload_object().unwrap()["formed_year"], json!(1944));

        let deleted = catalog.delete(CatalogTable::Artists, id, now).await.unwrap();
        assert_eq!(deleted.payload, None);
        assert!(catalog.get(CatalogTable::Artists, id).await.unwrap().is_none());

        assert!(matches!(
            catalog.delete(CatalogTable::Artists, id, now).await,
            Err(DbError::NotFound { .. })
        ));
        assert_eq!(db.change_log().count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_object_payload_is_rejected() {
        let db = setup().await;

        let err = db
            .catalog()
            .create(CatalogTable::Playlists, &json!(["not", "an", "object"]), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Domain(CoreError::MissingPayload { .. })));
    }

    #[tokio::test]
    async fn test_bool_columns_round_trip_as_integers() {
        let db = setup().await;

        let (row, _) = db
            .catalog()
            .create(CatalogTable::Playlists, &json!({"name": "Road trip", "is_public": true}), Utc::now())
            .await
            .unwrap();

        assert_eq!(row["is_public"], json!(1));
    }
}
