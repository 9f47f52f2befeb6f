//! `HttpTransport` against a mock primary.

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jukebox_sync::protocol::PushedChange;
use jukebox_sync::{HttpTransport, SyncError, SyncTransport};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(
        &server.uri(),
        "replica-a",
        "s3cret",
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn test_fetch_changes_sends_credentials_and_since() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/changes"))
        .and(header("x-node-id", "replica-a"))
        .and(header("x-signature", "s3cret"))
        .and(query_param("since", "2026-05-01T11:00:00+00:00"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [{
                "id": "c-1",
                "table": "genres",
                "record_id": "g-1",
                "type": "create",
                "data": {"name": "Jazz"},
                "timestamp": "2026-05-01T11:30:00Z"
            }],
            "count": 1,
            "since": "2026-05-01T11:00:00Z",
            "current_time": "2026-05-01T12:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = transport(&server)
        .fetch_changes(at("2026-05-01T11:00:00Z"))
        .await
        .unwrap();

    assert_eq!(page.count, 1);
    assert_eq!(page.changes[0].record_id, "g-1");
    assert_eq!(page.current_time, at("2026-05-01T12:00:00Z"));
}

#[tokio::test]
async fn test_acknowledge_posts_ids() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sync/ack"))
        .and(body_json(json!({"change_ids": ["c-1", "c-2"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(&server)
        .acknowledge(vec!["c-1".into(), "c-2".into()])
        .await
        .unwrap();
    assert_eq!(response.acknowledged, 2);
}

#[tokio::test]
async fn test_primary_behind_path_prefix() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/archive/api/sync/ack"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        &format!("{}/archive/api", server.uri()),
        "replica-a",
        "s3cret",
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .unwrap();

    let response = transport.acknowledge(vec!["c-1".into()]).await.unwrap();
    assert_eq!(response.acknowledged, 1);
}

#[tokio::test]
async fn test_push_changes_reads_batch_result() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sync/apply"))
        .and(body_json(json!({
            "changes": [{
                "id": "l-1",
                "table": "artists",
                "record_id": "ar-1",
                "type": "update",
                "data": {"country": "US"}
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "applied_count": 1,
            "error_count": 0,
            "errors": [],
            "applied_ids": ["l-1"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(&server)
        .push_changes(vec![PushedChange {
            id: Some("l-1".into()),
            table: "artists".into(),
            record_id: "ar-1".into(),
            change_type: "update".into(),
            data: Some(json!({"country": "US"})),
        }])
        .await
        .unwrap();

    assert_eq!(response.applied_count, 1);
    assert_eq!(response.applied_ids, vec!["l-1".to_string()]);
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth_failed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/initial_data"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid node credentials"})),
        )
        .mount(&server)
        .await;

    let err = transport(&server).fetch_initial_data().await.unwrap_err();
    assert!(err.is_auth_error(), "{err:?}");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("Invalid node credentials"));
}

#[tokio::test]
async fn test_server_error_is_retryable_rejection() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/changes"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = transport(&server).fetch_changes(Utc::now()).await.unwrap_err();
    match &err {
        SyncError::RemoteRejected { status, body } => {
            assert_eq!(*status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_malformed_body_is_protocol_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = transport(&server).status().await.unwrap_err();
    assert!(err.is_protocol_error(), "{err:?}");
}

#[tokio::test]
async fn test_slow_primary_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sync/changes"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({})),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        &server.uri(),
        "replica-a",
        "s3cret",
        Duration::from_secs(1),
        Duration::from_millis(200),
    )
    .unwrap();

    let err = transport.fetch_changes(Utc::now()).await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_primary_is_connection_failure() {
    // Bind and drop a listener to get a port nobody is serving.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::new(
        &format!("http://{addr}"),
        "replica-a",
        "s3cret",
        Duration::from_secs(1),
        Duration::from_secs(1),
    )
    .unwrap();

    let err = transport.acknowledge(vec!["c-1".into()]).await.unwrap_err();
    assert!(matches!(err, SyncError::ConnectionFailed(_)), "{err:?}");
    assert!(err.is_retryable());
}
