//! Primary endpoints driven through the router with `oneshot`.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Duration as ChronoDuration;
use pretty_assertions::assert_eq;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::*;
use jukebox_core::{CatalogTable, ManualClock};
use jukebox_db::Database;
use jukebox_sync::protocol::{
    AckResponse, ApplyResponse, ChangesResponse, ErrorBody, InitialDataResponse, StatusResponse,
};
use jukebox_sync::{router, InMemoryFlags, PrimaryState};

struct Primary {
    db: Database,
    app: Router,
    secret_a: String,
    secret_b: String,
}

async fn primary() -> Primary {
    let db = memory_db().await;
    let clock = Arc::new(ManualClock::new(t0()));

    let keys = db.node_keys();
    let secret_a = keys.issue_key("replica-a", "Branch A", t0()).await.unwrap();
    let secret_b = keys.issue_key("replica-b", "Branch B", t0()).await.unwrap();

    let state = PrimaryState::new("primary-1", db.clone(), Arc::new(InMemoryFlags::new()), clock);
    Primary {
        db,
        app: router(Arc::new(state)),
        secret_a,
        secret_b,
    }
}

fn get(uri: &str, node: &str, secret: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-node-id", node)
        .header("x-signature", secret)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, node: &str, secret: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-node-id", node)
        .header("x-signature", secret)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn call<T: DeserializeOwned>(app: &Router, request: Request<Body>) -> (StatusCode, T) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

const SINCE: &str = "/sync/changes?since=2026-05-01T11:00:00Z";

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_health_needs_no_credentials() {
    let primary = primary().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = primary.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_credentials_are_rejected() {
    let primary = primary().await;
    let request = Request::builder().uri(SINCE).body(Body::empty()).unwrap();

    let (status, body): (_, ErrorBody) = call(&primary.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body.error, "Missing node credentials");
}

#[tokio::test]
async fn test_wrong_or_revoked_secret_is_rejected() {
    let primary = primary().await;

    let (status, _): (_, ErrorBody) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_b)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _): (_, ErrorBody) = call(&primary.app, get(SINCE, "nobody", "x")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    primary.db.node_keys().deactivate("replica-a").await.unwrap();
    let (status, _): (_, ErrorBody) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_a)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_successful_auth_records_last_use() {
    let primary = primary().await;

    let (status, _): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_a)).await;
    assert_eq!(status, StatusCode::OK);

    let key = primary.db.node_keys().get("replica-a").await.unwrap().unwrap();
    assert_eq!(key.last_used_at, Some(t0()));
}

// =============================================================================
// Pull and acknowledge
// =============================================================================

#[tokio::test]
async fn test_acknowledged_changes_are_not_served_again() {
    let primary = primary().await;
    let catalog = primary.db.catalog();

    let (_, first) = catalog
        .create(CatalogTable::Genres, &json!({"name": "Jazz"}), t0() - ChronoDuration::minutes(10))
        .await
        .unwrap();
    let (_, second) = catalog
        .create(CatalogTable::Genres, &json!({"name": "Blues"}), t0() - ChronoDuration::minutes(5))
        .await
        .unwrap();

    let (status, page): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page.count, 2);
    assert_eq!(page.changes[0].id, first.id);
    assert_eq!(page.changes[1].id, second.id);
    assert_eq!(page.current_time, t0());

    let (_, ack): (_, AckResponse) = call(
        &primary.app,
        post(
            "/sync/ack",
            "replica-a",
            &primary.secret_a,
            json!({"change_ids": [first.id, second.id, "unknown"]}),
        ),
    )
    .await;
    assert_eq!(ack.acknowledged, 2);

    let (_, page): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_a)).await;
    assert_eq!(page.count, 0);

    // Another replica still sees both.
    let (_, page): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-b", &primary.secret_b)).await;
    assert_eq!(page.count, 2);
}

#[tokio::test]
async fn test_missing_or_bad_since_uses_one_hour_lookback() {
    let primary = primary().await;
    primary
        .db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "Old"}), t0() - ChronoDuration::hours(2))
        .await
        .unwrap();
    primary
        .db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "New"}), t0() - ChronoDuration::minutes(30))
        .await
        .unwrap();

    for uri in ["/sync/changes", "/sync/changes?since=not-a-date"] {
        let (_, page): (_, ChangesResponse) =
            call(&primary.app, get(uri, "replica-a", &primary.secret_a)).await;
        assert_eq!(page.count, 1, "{uri}");
        assert_eq!(page.since, t0() - ChronoDuration::hours(1));
    }
}

// =============================================================================
// Apply
// =============================================================================

#[tokio::test]
async fn test_apply_collects_per_record_errors() {
    let primary = primary().await;

    let body = json!({
        "changes": [
            {"id": "l-1", "table": "artists", "record_id": "ar-x", "type": "create",
             "data": {"id": "ar-x", "name": "Nina Simone", "created_at": "2020-01-01T00:00:00Z"}},
            {"id": "l-2", "table": "albums", "record_id": "al-x", "type": "create",
             "data": {"title": "Lost", "artist_id": "nope"}},
            {"id": "l-3", "table": "genres", "record_id": "g-x", "type": "create",
             "data": {"name": "Soul"}}
        ]
    });

    let (status, response): (_, ApplyResponse) =
        call(&primary.app, post("/sync/apply", "replica-a", &primary.secret_a, body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.applied_count, 2);
    assert_eq!(response.error_count, 1);
    assert_eq!(response.errors[0].change.id.as_deref(), Some("l-2"));
    assert_eq!(response.applied_ids, vec!["l-1".to_string(), "l-3".to_string()]);

    // Ids and timestamps were not taken from the replica.
    let artists = primary.db.catalog().export(CatalogTable::Artists).await.unwrap();
    assert_eq!(artists.len(), 1);
    assert_ne!(artists[0]["id"], json!("ar-x"));
    assert_eq!(artists[0]["created_at"], json!(t0().to_rfc3339()));

    // Logged for the other replicas, never echoed to the pusher.
    let (_, page): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-a", &primary.secret_a)).await;
    assert_eq!(page.count, 0);
    let (_, page): (_, ChangesResponse) =
        call(&primary.app, get(SINCE, "replica-b", &primary.secret_b)).await;
    assert_eq!(page.count, 2);
    assert_eq!(page.changes[0].record_id, artists[0]["id"].as_str().unwrap());
}

#[tokio::test]
async fn test_apply_remaps_foreign_keys_within_batch() {
    let primary = primary().await;

    let body = json!({
        "changes": [
            {"id": "l-1", "table": "artists", "record_id": "ar-x", "type": "create",
             "data": {"name": "Nina Simone"}},
            {"id": "l-2", "table": "albums", "record_id": "al-x", "type": "create",
             "data": {"title": "Pastel Blues", "artist_id": "ar-x"}}
        ]
    });

    let (_, response): (_, ApplyResponse) =
        call(&primary.app, post("/sync/apply", "replica-a", &primary.secret_a, body)).await;
    assert_eq!(response.error_count, 0);

    let catalog = primary.db.catalog();
    let artists = catalog.export(CatalogTable::Artists).await.unwrap();
    let albums = catalog.export(CatalogTable::Albums).await.unwrap();
    assert_eq!(albums[0]["artist_id"], artists[0]["id"]);
}

#[tokio::test]
async fn test_replica_ids_resolve_in_later_requests() {
    let primary = primary().await;
    let apply = |body: Value| post("/sync/apply", "replica-a", &primary.secret_a, body);

    let first = json!({
        "changes": [
            {"id": "l-1", "table": "artists", "record_id": "ar-x", "type": "create",
             "data": {"name": "Nina Simone"}}
        ]
    });
    let (_, response): (_, ApplyResponse) = call(&primary.app, apply(first)).await;
    assert_eq!(response.error_count, 0);

    // Next sync cycle: a child row and an edit, both by the replica's id.
    let second = json!({
        "changes": [
            {"id": "l-2", "table": "albums", "record_id": "al-x", "type": "create",
             "data": {"title": "Pastel Blues", "artist_id": "ar-x"}},
            {"id": "l-3", "table": "artists", "record_id": "ar-x", "type": "update",
             "data": {"country": "US"}}
        ]
    });
    let (_, response): (_, ApplyResponse) = call(&primary.app, apply(second)).await;
    assert_eq!(response.error_count, 0);
    assert_eq!(response.applied_ids, vec!["l-2".to_string(), "l-3".to_string()]);

    let catalog = primary.db.catalog();
    let artists = catalog.export(CatalogTable::Artists).await.unwrap();
    let albums = catalog.export(CatalogTable::Albums).await.unwrap();
    assert_eq!(artists.len(), 1);
    assert_eq!(artists[0]["country"], json!("US"));
    assert_eq!(albums[0]["artist_id"], artists[0]["id"]);

    let id_map = primary.db.id_map();
    assert_eq!(
        id_map.lookup("replica-a", CatalogTable::Artists, "ar-x").await.unwrap(),
        artists[0]["id"].as_str().map(str::to_string)
    );
    assert_eq!(id_map.count_for_node("replica-a").await.unwrap(), 2);

    // Another replica's "ar-x" is a different entity.
    let foreign = json!({
        "changes": [
            {"id": "b-1", "table": "artists", "record_id": "ar-x", "type": "update",
             "data": {"country": "FR"}}
        ]
    });
    let (_, response): (_, ApplyResponse) = call(
        &primary.app,
        post("/sync/apply", "replica-b", &primary.secret_b, foreign),
    )
    .await;
    assert_eq!(response.applied_count, 1);
    let artists = catalog.export(CatalogTable::Artists).await.unwrap();
    assert_eq!(artists[0]["country"], json!("US"));
}

#[tokio::test]
async fn test_update_and_delete_of_missing_rows_are_no_ops() {
    let primary = primary().await;

    let body = json!({
        "changes": [
            {"id": "l-1", "table": "songs", "record_id": "gone", "type": "update",
             "data": {"title": "x"}},
            {"id": "l-2", "table": "songs", "record_id": "gone", "type": "delete"}
        ]
    });

    let (_, response): (_, ApplyResponse) =
        call(&primary.app, post("/sync/apply", "replica-a", &primary.secret_a, body)).await;
    assert_eq!(response.applied_count, 2);
    assert_eq!(response.error_count, 0);
    assert_eq!(primary.db.change_log().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_table_is_reported_not_fatal() {
    let primary = primary().await;

    let body = json!({
        "changes": [
            {"id": "l-1", "table": "lyrics", "record_id": "x", "type": "create", "data": {}},
            {"id": "l-2", "table": "genres", "record_id": "g", "type": "create",
             "data": {"name": "Funk"}}
        ]
    });

    let (_, response): (_, ApplyResponse) =
        call(&primary.app, post("/sync/apply", "replica-a", &primary.secret_a, body)).await;
    assert_eq!(response.applied_count, 1);
    assert_eq!(response.error_count, 1);
    assert!(response.errors[0].error.contains("lyrics"));
}

// =============================================================================
// Status and bootstrap export
// =============================================================================

#[tokio::test]
async fn test_status_reports_counts_for_caller() {
    let primary = primary().await;
    let (_, change) = primary
        .db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "Jazz"}), t0())
        .await
        .unwrap();
    primary
        .db
        .change_log()
        .mark_applied_by_target(&change.id, "replica-b", t0())
        .await
        .unwrap();

    let (status, body): (_, StatusResponse) =
        call(&primary.app, get("/sync/status", "replica-a", &primary.secret_a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.node_id, "primary-1");
    assert_eq!(body.role, "primary");
    assert!(body.sync_enabled);
    assert!(body.healthy);
    assert_eq!(body.total_changes, 1);
    assert_eq!(body.pending_for_caller, 1);

    let (_, body): (_, StatusResponse) =
        call(&primary.app, get("/sync/status", "replica-b", &primary.secret_b)).await;
    assert_eq!(body.pending_for_caller, 0);
}

#[tokio::test]
async fn test_initial_data_exports_every_table() {
    let primary = primary().await;
    let catalog = primary.db.catalog();

    let (artist, _) = catalog
        .create(CatalogTable::Artists, &json!({"name": "Miles Davis"}), t0())
        .await
        .unwrap();
    catalog
        .create(
            CatalogTable::Albums,
            &json!({"title": "Kind of Blue", "artist_id": artist["id"]}),
            t0(),
        )
        .await
        .unwrap();
    catalog
        .create(CatalogTable::Playlists, &json!({"name": "Late night", "is_public": true}), t0())
        .await
        .unwrap();

    let (status, snapshot): (_, InitialDataResponse) =
        call(&primary.app, get("/sync/initial_data", "replica-a", &primary.secret_a)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(snapshot.clear_existing);
    assert_eq!(snapshot.total_records, 3);
    assert_eq!(snapshot.artists.len(), 1);
    assert_eq!(snapshot.albums[0]["artist_id"], artist["id"]);
    assert_eq!(snapshot.playlists.len(), 1);
    assert_eq!(snapshot.exported_at, t0());
}
