//! Shared helpers for the jukebox-sync integration tests.
//!
//! - [`ScriptedTransport`]: a [`SyncTransport`] that replays queued pages,
//!   records every call and can be made to fail or block
//! - database and orchestrator builders

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use jukebox_core::{CatalogTable, ChangeRecord, Clock, ManualClock, NewChange};
use jukebox_db::{Database, DbConfig, Row};
use jukebox_sync::protocol::{
    AckResponse, ApplyResponse, ChangesResponse, InitialDataResponse, PushedChange, WireChange,
};
use jukebox_sync::{
    InMemoryFlags, NodeRole, OrchestratorSettings, SyncError, SyncOrchestrator, SyncResult,
    SyncTransport,
};

// =============================================================================
// Scripted transport
// =============================================================================

type PushResponder = Box<dyn Fn(&[PushedChange]) -> ApplyResponse + Send + Sync>;

/// Replays scripted responses and records what the replica sent.
pub struct ScriptedTransport {
    clock: Arc<ManualClock>,
    pages: Mutex<VecDeque<Vec<WireChange>>>,
    initial: Mutex<Option<InitialDataResponse>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Gate>>>,
    push_responder: Mutex<PushResponder>,

    fetch_calls: AtomicUsize,
    since_seen: Mutex<Vec<DateTime<Utc>>>,
    acks: Mutex<Vec<Vec<String>>>,
    pushes: Mutex<Vec<Vec<PushedChange>>>,
}

/// Blocks `fetch_changes` until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedTransport {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        ScriptedTransport {
            clock,
            pages: Mutex::new(VecDeque::new()),
            initial: Mutex::new(None),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            gate: Mutex::new(None),
            push_responder: Mutex::new(Box::new(accept_all)),
            fetch_calls: AtomicUsize::new(0),
            since_seen: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub async fn queue_page(&self, changes: Vec<WireChange>) {
        self.pages.lock().await.push_back(changes);
    }

    pub async fn set_initial_data(&self, data: InitialDataResponse) {
        *self.initial.lock().await = Some(data);
    }

    /// Every call fails with a connection error until cleared.
    pub async fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().await = message.map(str::to_string);
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().await = delay;
    }

    pub async fn install_gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().await = Some(gate.clone());
        gate
    }

    pub async fn clear_gate(&self) {
        *self.gate.lock().await = None;
    }

    pub async fn respond_to_push<F>(&self, responder: F)
    where
        F: Fn(&[PushedChange]) -> ApplyResponse + Send + Sync + 'static,
    {
        *self.push_responder.lock().await = Box::new(responder);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub async fn since_seen(&self) -> Vec<DateTime<Utc>> {
        self.since_seen.lock().await.clone()
    }

    pub async fn acks(&self) -> Vec<Vec<String>> {
        self.acks.lock().await.clone()
    }

    pub async fn pushes(&self) -> Vec<Vec<PushedChange>> {
        self.pushes.lock().await.clone()
    }

    async fn check_failure(&self) -> SyncResult<()> {
        match self.failure.lock().await.as_ref() {
            Some(message) => Err(SyncError::ConnectionFailed(message.clone())),
            None => Ok(()),
        }
    }
}

fn accept_all(changes: &[PushedChange]) -> ApplyResponse {
    ApplyResponse {
        applied_count: changes.len(),
        error_count: 0,
        errors: Vec::new(),
        applied_ids: changes.iter().filter_map(|c| c.id.clone()).collect(),
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn fetch_changes(&self, since: DateTime<Utc>) -> SyncResult<ChangesResponse> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.since_seen.lock().await.push(since);

        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_failure().await?;

        let changes = self.pages.lock().await.pop_front().unwrap_or_default();
        Ok(ChangesResponse {
            count: changes.len(),
            changes,
            since,
            current_time: self.clock.now(),
        })
    }

    async fn acknowledge(&self, change_ids: Vec<String>) -> SyncResult<AckResponse> {
        self.check_failure().await?;
        let acknowledged = change_ids.len();
        self.acks.lock().await.push(change_ids);
        Ok(AckResponse { acknowledged })
    }

    async fn push_changes(&self, changes: Vec<PushedChange>) -> SyncResult<ApplyResponse> {
        self.check_failure().await?;
        let responder = self.push_responder.lock().await;
        let response = (**responder)(&changes);
        drop(responder);
        self.pushes.lock().await.push(changes);
        Ok(response)
    }

    async fn fetch_initial_data(&self) -> SyncResult<InitialDataResponse> {
        self.check_failure().await?;
        self.initial
            .lock()
            .await
            .clone()
            .ok_or_else(|| SyncError::RemoteRejected {
                status: 404,
                body: "no snapshot scripted".into(),
            })
    }
}

// =============================================================================
// Builders
// =============================================================================

pub async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Replica settings with bootstrap off unless a test turns it on.
pub fn replica_settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::for_role("replica-a", NodeRole::Replica);
    settings.bootstrap_on_first_sync = false;
    settings.interval = Duration::from_secs(3600);
    settings
}

pub struct ReplicaHarness {
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub flags: InMemoryFlags,
    pub orchestrator: SyncOrchestrator,
}

pub async fn replica(settings: OrchestratorSettings) -> ReplicaHarness {
    let db = memory_db().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let transport = Arc::new(ScriptedTransport::new(clock.clone()));
    let flags = InMemoryFlags::new();

    let orchestrator = SyncOrchestrator::new(
        settings,
        db.clone(),
        Some(transport.clone() as Arc<dyn SyncTransport>),
        Arc::new(flags.clone()),
        clock.clone(),
    )
    .unwrap();

    ReplicaHarness {
        db,
        clock,
        transport,
        flags,
        orchestrator,
    }
}

// =============================================================================
// Change helpers
// =============================================================================

pub fn object(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

/// A primary change as it would arrive on the wire.
pub fn wire(id: &str, change: NewChange, at: DateTime<Utc>) -> WireChange {
    WireChange::from(&change.into_record(id.to_string(), at))
}

pub fn genre_create(entity_id: &str, name: &str) -> NewChange {
    NewChange::create(
        CatalogTable::Genres,
        entity_id,
        serde_json::json!({ "id": entity_id, "name": name }),
    )
}

pub fn ids(changes: &[ChangeRecord]) -> Vec<String> {
    changes.iter().map(|c| c.id.clone()).collect()
}
