//! A replica syncing with a real primary over loopback HTTP.

mod common;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use jukebox_core::{CatalogTable, Clock, SystemClock, PRIMARY_TARGET};
use jukebox_sync::{
    HttpTransport, InMemoryFlags, IterationOutcome, PrimaryServer, PrimaryState, SyncOrchestrator,
    SyncTransport, Trigger,
};

fn clock_now() -> DateTime<Utc> {
    SystemClock.now()
}

fn genre_names(rows: &[jukebox_db::Row]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_replica_bootstraps_pulls_and_pushes() {
    let clock = Arc::new(SystemClock);

    // Primary
    let primary_db = memory_db().await;
    primary_db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "Jazz"}), clock_now())
        .await
        .unwrap();
    let secret = primary_db
        .node_keys()
        .issue_key("replica-a", "Branch A", clock_now())
        .await
        .unwrap();

    let state = PrimaryState::new(
        "primary-1",
        primary_db.clone(),
        Arc::new(InMemoryFlags::new()),
        clock.clone(),
    );
    let handle = PrimaryServer::new("127.0.0.1:0", state).start().await.unwrap();

    // Replica
    let replica_db = memory_db().await;
    let transport = HttpTransport::new(
        &format!("http://{}", handle.local_addr()),
        "replica-a",
        secret,
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .unwrap();

    let mut settings = replica_settings();
    settings.bootstrap_on_first_sync = true;
    let orchestrator = SyncOrchestrator::new(
        settings,
        replica_db.clone(),
        Some(Arc::new(transport) as Arc<dyn SyncTransport>),
        Arc::new(InMemoryFlags::new()),
        clock.clone(),
    )
    .unwrap();

    // First run copies the catalog.
    match orchestrator.run_iteration(Trigger::Forced).await {
        IterationOutcome::Bootstrapped(report) => assert_eq!(report.inserted, 1),
        other => panic!("expected bootstrap, got {other:?}"),
    }
    let replica_genres = replica_db.catalog().export(CatalogTable::Genres).await.unwrap();
    assert_eq!(genre_names(&replica_genres), vec!["Jazz"]);

    tokio::time::sleep(Duration::from_millis(20)).await;

    // One change on each side.
    let (blues, _) = primary_db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "Blues"}), clock_now())
        .await
        .unwrap();
    replica_db
        .catalog()
        .create(CatalogTable::Genres, &json!({"name": "Soul"}), clock_now())
        .await
        .unwrap();

    match orchestrator.run_iteration(Trigger::Forced).await {
        IterationOutcome::Synced(report) => {
            assert_eq!(report.pull.applied, 1);
            assert_eq!(report.push.pushed, 1);
            assert_eq!(report.push.applied, 1);
        }
        other => panic!("expected sync, got {other:?}"),
    }

    // Pulled rows keep the primary's id.
    let pulled = replica_db
        .catalog()
        .get(CatalogTable::Genres, blues["id"].as_str().unwrap())
        .await
        .unwrap();
    assert!(pulled.is_some());

    let primary_genres = primary_db.catalog().export(CatalogTable::Genres).await.unwrap();
    let replica_genres = replica_db.catalog().export(CatalogTable::Genres).await.unwrap();
    assert_eq!(genre_names(&primary_genres), vec!["Blues", "Jazz", "Soul"]);
    assert_eq!(genre_names(&replica_genres), vec!["Blues", "Jazz", "Soul"]);

    // Only the pre-snapshot change stays unconfirmed on the primary; the
    // replica got it through the bootstrap.
    assert_eq!(
        replica_db.change_log().count_pending(PRIMARY_TARGET).await.unwrap(),
        0
    );
    assert_eq!(
        primary_db.change_log().count_pending("replica-a").await.unwrap(),
        1
    );

    match orchestrator.run_iteration(Trigger::Forced).await {
        IterationOutcome::Synced(report) => {
            assert_eq!(report.pull.received, 0);
            assert_eq!(report.push.pushed, 0);
        }
        other => panic!("expected quiet sync, got {other:?}"),
    }

    handle.shutdown().await.unwrap();
}
