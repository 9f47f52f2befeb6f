//! # Primary Server
//!
//! HTTP endpoints a primary serves to its replicas.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PrimaryServer (Axum)                             │
//! │                                                                         │
//! │  GET  /health              unauthenticated liveness                     │
//! │                                                                         │
//! │  ── authenticate (X-Node-ID + X-Signature vs. node_keys) ────────────   │
//! │                                                                         │
//! │  GET  /sync/changes        changes after ?since the caller has not     │
//! │                            acknowledged (≤ 100, oldest first)          │
//! │  POST /sync/ack            mark change ids applied by the caller       │
//! │  POST /sync/apply          apply pushed changes, one transaction each  │
//! │  GET  /sync/status         role, flags, counts, health                 │
//! │  GET  /sync/initial_data   full catalog export for bootstrap           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Applying pushed changes
//! Each pushed change is applied, recorded in this node's change log and
//! acknowledged for the pushing replica inside one transaction. Other
//! replicas pick it up on their next pull; the pusher never sees it again.
//! A failing change is reported in `errors` and its siblings continue.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jukebox_core::{CatalogTable, ChangeKind, Clock, NewChange};
use jukebox_db::repository::catalog;
use jukebox_db::{effective_since, mark_applied_on, record_on, Database, DbError};

use crate::apply::ApplyEngine;
use crate::config::NodeRole;
use crate::error::{SyncError, SyncResult};
use crate::flags::ControlFlags;
use crate::protocol::{
    AckRequest, AckResponse, ApplyErrorEntry, ApplyRequest, ApplyResponse, ChangesQuery,
    ChangesResponse, ErrorBody, InitialDataResponse, PushedChange, StatusResponse, WireChange,
    ACK_PATH, APPLY_PATH, CHANGES_PATH, HEALTH_PATH, INITIAL_DATA_PATH, NODE_ID_HEADER,
    SIGNATURE_HEADER, STATUS_PATH,
};

// =============================================================================
// State
// =============================================================================

/// Shared state behind every handler.
pub struct PrimaryState {
    node_id: String,
    role: NodeRole,
    db: Database,
    flags: Arc<dyn ControlFlags>,
    clock: Arc<dyn Clock>,
}

impl PrimaryState {
    pub fn new(
        node_id: impl Into<String>,
        db: Database,
        flags: Arc<dyn ControlFlags>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        PrimaryState {
            node_id: node_id.into(),
            role: NodeRole::Primary,
            db,
            flags,
            clock,
        }
    }
}

/// Node id of an authenticated caller, set by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedNode(pub String);

/// Builds the router. Exposed separately so tests can drive it with
/// `oneshot` without binding a socket.
pub fn router(state: Arc<PrimaryState>) -> Router {
    let sync_routes = Router::new()
        .route(CHANGES_PATH, get(changes_handler))
        .route(ACK_PATH, post(ack_handler))
        .route(APPLY_PATH, post(apply_handler))
        .route(STATUS_PATH, get(status_handler))
        .route(INITIAL_DATA_PATH, get(initial_data_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .merge(sync_routes)
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// Binds the router to a TCP listener.
pub struct PrimaryServer {
    bind_addr: String,
    state: Arc<PrimaryState>,
}

/// Handle for a running [`PrimaryServer`].
pub struct PrimaryHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PrimaryHandle {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Server shutdown channel closed".into()))?;
        self.task.await?;
        Ok(())
    }
}

impl PrimaryServer {
    pub fn new(bind_addr: impl Into<String>, state: PrimaryState) -> Self {
        PrimaryServer {
            bind_addr: bind_addr.into(),
            state: Arc::new(state),
        }
    }

    /// Binds and serves in the background.
    pub async fn start(self) -> SyncResult<PrimaryHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", self.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        let app = router(self.state);

        info!(addr = %local_addr, "Primary server started");

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Primary server shutting down");
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Primary server exited with error");
            }
        });

        Ok(PrimaryHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error response with a JSON [`ErrorBody`].
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        warn!(error = %err, "Database error while serving sync request");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = if err.is_protocol_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Middleware
// =============================================================================

async fn authenticate(
    State(state): State<Arc<PrimaryState>>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let headers = request.headers();
    let (Some(node_id), Some(secret)) = (
        header_value(headers, NODE_ID_HEADER),
        header_value(headers, SIGNATURE_HEADER),
    ) else {
        warn!(path = %request.uri().path(), "Sync request without node credentials");
        return Err(ApiError::unauthorized("Missing node credentials"));
    };

    let verified = state
        .db
        .node_keys()
        .verify(&node_id, &secret, state.clock.now())
        .await?;
    if !verified {
        warn!(node_id = %node_id, "Rejected node credentials");
        return Err(ApiError::unauthorized("Invalid node credentials"));
    }

    request.extensions_mut().insert(AuthenticatedNode(node_id));
    Ok(next.run(request).await)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<PrimaryState>>) -> impl IntoResponse {
    if state.db.health_check().await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DATABASE UNAVAILABLE")
    }
}

async fn changes_handler(
    State(state): State<Arc<PrimaryState>>,
    Extension(caller): Extension<AuthenticatedNode>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Json<ChangesResponse>> {
    let now = state.clock.now();
    let since = effective_since(query.since.as_deref().and_then(parse_since), now);

    let changes = state
        .db
        .change_log()
        .changes_since(Some(since), &caller.0, now)
        .await?;

    debug!(node_id = %caller.0, since = %since, count = changes.len(), "Serving changes");

    let changes: Vec<WireChange> = changes.iter().map(WireChange::from).collect();
    Ok(Json(ChangesResponse {
        count: changes.len(),
        changes,
        since,
        current_time: now,
    }))
}

async fn ack_handler(
    State(state): State<Arc<PrimaryState>>,
    Extension(caller): Extension<AuthenticatedNode>,
    Json(request): Json<AckRequest>,
) -> ApiResult<Json<AckResponse>> {
    let now = state.clock.now();
    let change_log = state.db.change_log();

    let mut acknowledged = 0;
    for id in &request.change_ids {
        if change_log.mark_applied_by_target(id, &caller.0, now).await? {
            acknowledged += 1;
        }
    }

    debug!(node_id = %caller.0, requested = request.change_ids.len(), acknowledged, "Acknowledged changes");
    Ok(Json(AckResponse { acknowledged }))
}

async fn apply_handler(
    State(state): State<Arc<PrimaryState>>,
    Extension(caller): Extension<AuthenticatedNode>,
    Json(request): Json<ApplyRequest>,
) -> Json<ApplyResponse> {
    let mut response = ApplyResponse::default();

    for pushed in request.changes {
        match apply_pushed(&state, &caller.0, &pushed).await {
            Ok(()) => {
                response.applied_count += 1;
                if let Some(id) = &pushed.id {
                    response.applied_ids.push(id.clone());
                }
            }
            Err(e) => {
                warn!(
                    node_id = %caller.0,
                    table = %pushed.table,
                    record_id = %pushed.record_id,
                    error = %e,
                    "Failed to apply pushed change"
                );
                response.error_count += 1;
                response.errors.push(ApplyErrorEntry {
                    change: pushed,
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        node_id = %caller.0,
        applied = response.applied_count,
        failed = response.error_count,
        "Applied pushed batch"
    );
    Json(response)
}

/// Applies one pushed change and logs it for the other replicas.
///
/// Replica ids are translated through the caller's persisted id map, which
/// commits or rolls back with the change itself.
async fn apply_pushed(state: &PrimaryState, caller: &str, pushed: &PushedChange) -> SyncResult<()> {
    let now = state.clock.now();
    let record = pushed.to_record(now)?;
    let table = record.entity_table;

    let mut tx = state.db.begin().await?;
    let outcome = ApplyEngine::for_node(caller).apply(&mut tx, &record, now).await?;

    if let Some((entity_id, kind)) = outcome.changed() {
        let change = match kind {
            ChangeKind::Delete => NewChange::delete(table, entity_id),
            ChangeKind::Create | ChangeKind::Update => {
                let row = catalog::fetch_row(&mut tx, table, entity_id)
                    .await?
                    .ok_or_else(|| DbError::not_found(table.as_str(), entity_id))?;
                if kind == ChangeKind::Create {
                    NewChange::create(table, entity_id, Value::Object(row))
                } else {
                    NewChange::update(table, entity_id, Value::Object(row))
                }
            }
        };

        let logged = record_on(&mut tx, change, now).await?;
        mark_applied_on(&mut tx, &logged.id, caller, now).await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn status_handler(
    State(state): State<Arc<PrimaryState>>,
    Extension(caller): Extension<AuthenticatedNode>,
) -> ApiResult<Json<StatusResponse>> {
    let now = state.clock.now();
    let flags = state.flags.snapshot().await?;
    let change_log = state.db.change_log();

    Ok(Json(StatusResponse {
        node_id: state.node_id.clone(),
        role: state.role.to_string(),
        sync_enabled: flags.enabled && !flags.emergency_stop,
        last_sync: state.db.sync_status().last_success().await?,
        total_changes: change_log.count().await?,
        pending_for_caller: change_log.count_pending(&caller.0).await?,
        healthy: state.db.health_check().await,
        current_time: now,
    }))
}

async fn initial_data_handler(
    State(state): State<Arc<PrimaryState>>,
    Extension(caller): Extension<AuthenticatedNode>,
) -> ApiResult<Json<InitialDataResponse>> {
    let now = state.clock.now();
    let mut response = InitialDataResponse::new(now);

    let mut tx = state.db.begin().await?;
    for table in CatalogTable::DEPENDENCY_ORDER {
        let rows = catalog::export_table(&mut tx, table).await?;
        response.set_records(table, rows);
    }
    tx.commit().await.map_err(DbError::from)?;

    info!(node_id = %caller.0, total_records = response.total_records, "Served initial data");
    Ok(Json(response))
}

/// Parses the `since` query value.
///
/// A `+` offset arrives as a space when the client did not percent-encode
/// it. Naive timestamps are taken as UTC. Anything else falls back to the
/// default lookback.
fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().replace(' ', "+");
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Some(dt.with_timezone(&Utc));
    }

    match NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            debug!(since = %raw, "Unparsable since, using default lookback");
            None
        }
    }
}
