//! # Sync Orchestrator
//!
//! Drives one node's replication on a fixed interval.
//!
//! ## Iteration
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One iteration                                    │
//! │                                                                         │
//! │  stop requested? ──yes──► Stopped                                      │
//! │        │                                                                │
//! │  flags: emergency_stop ─► EmergencyStopped                             │
//! │         !enabled ───────► Disabled                                     │
//! │         paused ─────────► Paused                                       │
//! │        │                                                                │
//! │  role ─┬─ Primary ──────► PrimaryIdle   (replicas come to us)          │
//! │        ├─ Standalone ───► Heartbeat     ("system" tracker row)         │
//! │        └─ Replica                                                       │
//! │             │                                                           │
//! │        breaker open? ──► BreakerOpen                                   │
//! │             │                                                           │
//! │        recover stale in_progress rows                                  │
//! │        begin_attempt ── None ──► InFlight                              │
//! │             │                                                           │
//! │        never synced? ─► bootstrap (Initial)                            │
//! │        otherwise ─────► pull + push (Database)                         │
//! │             │              under attempt_timeout                        │
//! │             ▼                                                           │
//! │        ok  → breaker.record_success, tracker success                   │
//! │        err → breaker.record_failure, tracker failed + backoff          │
//! │        tracker write fails → fresh row written as failed               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pull watermark only moves when a pull drains the primary. A pull
//! cut short by `max_pages` keeps the previous one, so the backlog is
//! fetched again next time.
//!
//! ## Control Surface
//! [`SyncOrchestrator`] is cheap to clone and every clone controls the same
//! loop: `start`, `stop`, `pause`, `resume`, `emergency_stop`,
//! `force_sync`, `status`.
//!
//! An iteration never returns an error. Failures become
//! [`IterationOutcome::Failed`] and the loop keeps its schedule.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use jukebox_core::{
    BreakerSnapshot, CircuitBreaker, CircuitState, Clock, SyncTargetState, SyncType, TargetStatus,
    PRIMARY_TARGET, SYSTEM_TARGET,
};
use jukebox_db::{effective_since, Database};

use crate::config::{NodeConfig, NodeRole};
use crate::error::{SyncError, SyncResult};
use crate::flags::{ControlFlags, FlagSnapshot};
use crate::replica::{BootstrapReport, ReplicaSession, SyncReport};
use crate::transport::SyncTransport;

/// Metadata key holding the primary-clock watermark of the last pull.
const PULL_SINCE_KEY: &str = "pull_since";

/// Metadata key holding the snapshot time of the bootstrap.
const EXPORTED_AT_KEY: &str = "exported_at";

// =============================================================================
// Settings
// =============================================================================

/// Orchestrator knobs, usually taken from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub node_id: String,
    pub role: NodeRole,
    pub interval: Duration,
    pub attempt_timeout: Duration,
    pub batch_size: usize,
    pub max_pages: usize,
    pub breaker_threshold: u32,
    pub breaker_cooldown: chrono::Duration,
    pub bootstrap_on_first_sync: bool,
    /// `in_progress` rows older than this are reset before each attempt.
    pub stale_attempt_age: chrono::Duration,
}

impl OrchestratorSettings {
    /// Defaults for `role`, matching a freshly generated config.
    pub fn for_role(node_id: impl Into<String>, role: NodeRole) -> Self {
        let mut config = NodeConfig::default();
        config.node.id = node_id.into();
        config.node.role = role;
        OrchestratorSettings::from(&config)
    }
}

impl From<&NodeConfig> for OrchestratorSettings {
    fn from(config: &NodeConfig) -> Self {
        let attempt_timeout = config.sync.attempt_timeout();
        let stale_secs = (config.sync.attempt_timeout_secs * 2).max(60) as i64;

        OrchestratorSettings {
            node_id: config.node_id().to_string(),
            role: config.role(),
            interval: config.sync.interval(),
            attempt_timeout,
            batch_size: config.sync.batch_size,
            max_pages: config.sync.max_pages,
            breaker_threshold: config.sync.breaker_threshold,
            breaker_cooldown: chrono::Duration::seconds(config.sync.breaker_cooldown_secs as i64),
            bootstrap_on_first_sync: config.sync.bootstrap_on_first_sync,
            stale_attempt_age: chrono::Duration::seconds(stale_secs),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why an iteration ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Forced,
}

/// Result of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    Disabled,
    Paused,
    EmergencyStopped,
    BreakerOpen,
    /// Another attempt on the same target holds `in_progress`.
    InFlight,
    PrimaryIdle,
    Heartbeat,
    Bootstrapped(BootstrapReport),
    Synced(SyncReport),
    Failed(String),
    /// The attempt finished after `stop()`; its result was not reported.
    Discarded,
    Stopped,
}

impl IterationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, IterationOutcome::Failed(_))
    }
}

/// Reply to [`SyncOrchestrator::force_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceSyncAck {
    Queued,
    NotRunning,
}

/// Snapshot for dashboards and the CLI.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct OrchestratorStatus {
    pub node_id: String,
    #[ts(as = "String")]
    pub role: NodeRole,
    pub running: bool,
    pub enabled: bool,
    pub paused: bool,
    pub emergency_stop: bool,
    pub breaker: BreakerSnapshot,
    #[ts(as = "Option<String>")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Local changes the primary has not confirmed (replicas only).
    pub pending_changes: i64,
    /// Pending changes the primary refused too often to re-send.
    pub parked_changes: i64,
    pub recent_failures: usize,
    pub pending_retries: usize,
    pub healthy: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

struct ControlState {
    breaker: CircuitBreaker,
    stop_requested: bool,
    running: bool,
}

struct Inner {
    settings: OrchestratorSettings,
    db: Database,
    transport: Option<Arc<dyn SyncTransport>>,
    flags: Arc<dyn ControlFlags>,
    clock: Arc<dyn Clock>,
    control: Mutex<ControlState>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Scheduler, breaker and control surface for one node.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Result of the attempt body.
enum Work {
    Bootstrap(BootstrapReport),
    Sync(SyncReport),
}

impl SyncOrchestrator {
    /// Creates an orchestrator. Replicas need a transport.
    pub fn new(
        settings: OrchestratorSettings,
        db: Database,
        transport: Option<Arc<dyn SyncTransport>>,
        flags: Arc<dyn ControlFlags>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        if settings.role == NodeRole::Replica && transport.is_none() {
            return Err(SyncError::InvalidConfig(
                "a replica needs a transport to reach its primary".into(),
            ));
        }

        let breaker = CircuitBreaker::new(settings.breaker_threshold, settings.breaker_cooldown);

        Ok(SyncOrchestrator {
            inner: Arc::new(Inner {
                settings,
                db,
                transport,
                flags,
                clock,
                control: Mutex::new(ControlState {
                    breaker,
                    stop_requested: false,
                    running: false,
                }),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the scheduled loop. The first iteration runs immediately.
    ///
    /// Calling `start` on a running orchestrator is a no-op.
    pub async fn start(&self) -> SyncResult<()> {
        {
            let mut control = self.inner.control.lock().await;
            if control.running {
                debug!("Orchestrator already running");
                return Ok(());
            }
            control.running = true;
            control.stop_requested = false;
        }

        self.recover_stale(self.inner.clock.now()).await?;

        info!(
            node_id = %self.inner.settings.node_id,
            role = %self.inner.settings.role,
            interval_secs = self.inner.settings.interval.as_secs(),
            "Sync orchestrator started"
        );

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stops the loop and waits for it to exit.
    ///
    /// An attempt already in flight is allowed to finish; its outcome is
    /// discarded.
    pub async fn stop(&self) -> SyncResult<()> {
        info!("Stopping sync orchestrator");
        self.inner.control.lock().await.stop_requested = true;
        self.inner.wake.notify_one();

        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            handle.await?;
        }

        self.inner.control.lock().await.running = false;
        info!("Sync orchestrator stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.control.lock().await.running
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.wake.notified() => {}
            }

            if self.stop_requested().await {
                break;
            }

            let outcome = self.run_iteration(Trigger::Scheduled).await;
            log_outcome(Trigger::Scheduled, &outcome);
            if outcome == IterationOutcome::Stopped {
                break;
            }
        }

        self.inner.control.lock().await.running = false;
        debug!("Orchestrator loop exited");
    }

    async fn stop_requested(&self) -> bool {
        self.inner.control.lock().await.stop_requested
    }

    async fn recover_stale(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let recovered = self
            .inner
            .db
            .sync_status()
            .recover_stale(self.inner.settings.stale_attempt_age, now)
            .await?;
        if recovered > 0 {
            warn!(recovered, "Reset attempts left in progress");
        }
        Ok(recovered)
    }

    // =========================================================================
    // Flags
    // =========================================================================

    pub async fn pause(&self) -> SyncResult<()> {
        info!("Pausing sync");
        self.inner.flags.set_paused(true).await
    }

    pub async fn resume(&self) -> SyncResult<()> {
        info!("Resuming sync");
        self.inner.flags.set_paused(false).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        info!(enabled, "Setting sync enabled flag");
        self.inner.flags.set_enabled(enabled).await
    }

    /// Raises the emergency stop flag and halts the loop.
    pub async fn emergency_stop(&self) -> SyncResult<()> {
        warn!("Emergency stop requested");
        self.inner.flags.set_emergency_stop(true).await?;
        self.stop().await
    }

    /// Lowers the emergency stop flag and restarts the loop.
    pub async fn clear_emergency_stop(&self) -> SyncResult<()> {
        info!("Clearing emergency stop");
        self.inner.flags.set_emergency_stop(false).await?;
        self.start().await
    }

    /// Runs one iteration now, outside the schedule.
    ///
    /// Returns immediately; the iteration runs on its own task and is
    /// subject to the same flags, breaker and in-flight guard.
    pub async fn force_sync(&self) -> ForceSyncAck {
        if !self.is_running().await {
            return ForceSyncAck::NotRunning;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run_iteration(Trigger::Forced).await;
            log_outcome(Trigger::Forced, &outcome);
        });
        ForceSyncAck::Queued
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Runs a single iteration and reports what happened.
    pub async fn run_iteration(&self, trigger: Trigger) -> IterationOutcome {
        if self.stop_requested().await {
            return IterationOutcome::Stopped;
        }

        match self.try_iteration(trigger).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, ?trigger, "Sync iteration failed before the attempt");
                IterationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_iteration(&self, trigger: Trigger) -> SyncResult<IterationOutcome> {
        let flags = self.inner.flags.snapshot().await?;
        if let Some(outcome) = gate(&flags) {
            return Ok(outcome);
        }

        match self.inner.settings.role {
            NodeRole::Primary => Ok(IterationOutcome::PrimaryIdle),
            NodeRole::Standalone => self.heartbeat().await,
            NodeRole::Replica => self.replica_attempt(trigger).await,
        }
    }

    async fn heartbeat(&self) -> SyncResult<IterationOutcome> {
        let status = self.inner.db.sync_status();
        let now = self.inner.clock.now();
        self.recover_stale(now).await?;

        let Some(mut state) = status
            .begin_attempt(SyncType::Database, SYSTEM_TARGET, now)
            .await?
        else {
            return Ok(IterationOutcome::InFlight);
        };

        state.mark_successful(now, Some(json!({ "heartbeat": true })))?;
        status.save(&state).await?;
        debug!("Standalone heartbeat recorded");
        Ok(IterationOutcome::Heartbeat)
    }

    async fn replica_attempt(&self, trigger: Trigger) -> SyncResult<IterationOutcome> {
        let settings = &self.inner.settings;
        let now = self.inner.clock.now();

        {
            let mut control = self.inner.control.lock().await;
            match control.breaker.check(now) {
                CircuitState::Open => {
                    debug!(
                        failures = control.breaker.failure_count(),
                        "Circuit breaker open, skipping attempt"
                    );
                    return Ok(IterationOutcome::BreakerOpen);
                }
                CircuitState::HalfOpen => info!("Breaker cooldown elapsed, probing primary"),
                CircuitState::Closed => {}
            }
        }

        self.recover_stale(now).await?;

        let status = self.inner.db.sync_status();
        let database_state = status.get(SyncType::Database, PRIMARY_TARGET).await?;
        let initial_state = status.get(SyncType::Initial, PRIMARY_TARGET).await?;

        let never_synced = database_state
            .as_ref()
            .and_then(|s| s.last_success_at)
            .is_none()
            && initial_state.as_ref().and_then(|s| s.last_success_at).is_none();
        let bootstrap = settings.bootstrap_on_first_sync && never_synced;
        let sync_type = if bootstrap {
            SyncType::Initial
        } else {
            SyncType::Database
        };

        let Some(mut state) = status.begin_attempt(sync_type, PRIMARY_TARGET, now).await? else {
            return Ok(IterationOutcome::InFlight);
        };

        let since = effective_since(
            pull_since(database_state.as_ref(), initial_state.as_ref()),
            now,
        );
        debug!(?trigger, sync_type = %sync_type, since = %since, "Starting sync attempt");

        let result = self.attempt(bootstrap, since).await;
        let finished = self.inner.clock.now();

        let discarded = {
            let mut control = self.inner.control.lock().await;
            if !control.stop_requested {
                match &result {
                    Ok(_) => control.breaker.record_success(),
                    Err(_) => control.breaker.record_failure(finished),
                }
            }
            control.stop_requested
        };

        let recorded = match record_result(&mut state, result, since, finished) {
            Ok(outcome) => status.save(&state).await.map(|_| outcome).map_err(SyncError::from),
            Err(e) => Err(e),
        };
        let outcome = match recorded {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_attempt(sync_type, finished, &e).await;
                return Err(e);
            }
        };

        if discarded {
            debug!("Attempt finished after stop, discarding outcome");
            return Ok(IterationOutcome::Discarded);
        }
        Ok(outcome)
    }

    /// Fails the `in_progress` row of an attempt whose result could not be
    /// recorded, so later attempts are not turned away as in flight.
    async fn release_attempt(&self, sync_type: SyncType, now: DateTime<Utc>, cause: &SyncError) {
        match self.fail_in_progress(sync_type, now, cause).await {
            Ok(true) => warn!(
                sync_type = %sync_type,
                error = %cause,
                "Released attempt after its tracker write failed"
            ),
            Ok(false) => {}
            Err(e) => error!(
                sync_type = %sync_type,
                error = %e,
                "Failed to release attempt, it stays in progress until recovered as stale"
            ),
        }
    }

    async fn fail_in_progress(
        &self,
        sync_type: SyncType,
        now: DateTime<Utc>,
        cause: &SyncError,
    ) -> SyncResult<bool> {
        let status = self.inner.db.sync_status();
        let Some(mut state) = status.get(sync_type, PRIMARY_TARGET).await? else {
            return Ok(false);
        };
        if state.status != TargetStatus::InProgress {
            return Ok(false);
        }

        state.mark_failed(now, format!("Failed to record attempt: {cause}"), None)?;
        status.save(&state).await?;
        Ok(true)
    }

    async fn attempt(&self, bootstrap: bool, since: DateTime<Utc>) -> SyncResult<Work> {
        let settings = &self.inner.settings;
        let transport = self
            .inner
            .transport
            .clone()
            .ok_or_else(|| SyncError::InvalidConfig("replica has no transport".into()))?;

        let session = ReplicaSession::new(
            self.inner.db.clone(),
            transport,
            self.inner.clock.clone(),
            settings.batch_size,
            settings.max_pages,
        );

        let work = async {
            if bootstrap {
                session.bootstrap().await.map(Work::Bootstrap)
            } else {
                session.sync(since).await.map(Work::Sync)
            }
        };

        match tokio::time::timeout(settings.attempt_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(settings.attempt_timeout.as_secs())),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> SyncResult<OrchestratorStatus> {
        let now = self.inner.clock.now();
        let (running, breaker) = {
            let control = self.inner.control.lock().await;
            (control.running, control.breaker.snapshot(now))
        };

        let flags = self.inner.flags.snapshot().await?;
        let status = self.inner.db.sync_status();

        let (pending_changes, parked_changes) = if self.inner.settings.role == NodeRole::Replica {
            let change_log = self.inner.db.change_log();
            (
                change_log.count_pending(PRIMARY_TARGET).await?,
                change_log.count_parked(PRIMARY_TARGET).await?,
            )
        } else {
            (0, 0)
        };

        Ok(OrchestratorStatus {
            node_id: self.inner.settings.node_id.clone(),
            role: self.inner.settings.role,
            running,
            enabled: flags.enabled,
            paused: flags.paused,
            emergency_stop: flags.emergency_stop,
            breaker,
            last_sync: status.last_success().await?,
            pending_changes,
            parked_changes,
            recent_failures: status.recent_failures(now).await?.len(),
            pending_retries: status.pending_retries(now).await?.len(),
            healthy: self.healthy().await?,
        })
    }

    /// Every tracker row.
    pub async fn target_states(&self) -> SyncResult<Vec<SyncTargetState>> {
        Ok(self.inner.db.sync_status().list().await?)
    }

    /// Moves failed targets back to idle. Returns how many were reset.
    pub async fn clear_failed(&self) -> SyncResult<u64> {
        let cleared = self
            .inner
            .db
            .sync_status()
            .clear_failed(self.inner.clock.now())
            .await?;
        info!(cleared, "Cleared failed sync targets");
        Ok(cleared)
    }

    /// Running, and either the database answers (primary) or some target
    /// succeeded within the health window.
    pub async fn healthy(&self) -> SyncResult<bool> {
        if !self.is_running().await {
            return Ok(false);
        }

        match self.inner.settings.role {
            NodeRole::Primary => Ok(self.inner.db.health_check().await),
            _ => Ok(self
                .inner
                .db
                .sync_status()
                .any_healthy(self.inner.clock.now())
                .await?),
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn gate(flags: &FlagSnapshot) -> Option<IterationOutcome> {
    if flags.emergency_stop {
        Some(IterationOutcome::EmergencyStopped)
    } else if !flags.enabled {
        Some(IterationOutcome::Disabled)
    } else if flags.paused {
        Some(IterationOutcome::Paused)
    } else {
        None
    }
}

/// Where the next pull starts: the last pull's primary-clock watermark,
/// else the last success, else the bootstrap snapshot time.
fn pull_since(
    database: Option<&SyncTargetState>,
    initial: Option<&SyncTargetState>,
) -> Option<DateTime<Utc>> {
    let from_metadata = |state: &SyncTargetState, key: &str| {
        state
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    database
        .and_then(|s| from_metadata(s, PULL_SINCE_KEY).or(s.last_success_at))
        .or_else(|| initial.and_then(|s| from_metadata(s, EXPORTED_AT_KEY)))
}

/// Moves the attempt's tracker state to success or failure.
fn record_result(
    state: &mut SyncTargetState,
    result: SyncResult<Work>,
    since: DateTime<Utc>,
    finished: DateTime<Utc>,
) -> SyncResult<IterationOutcome> {
    let outcome = match result {
        Ok(Work::Bootstrap(report)) => {
            state.mark_successful(
                finished,
                Some(json!({
                    EXPORTED_AT_KEY: report.exported_at.to_rfc3339(),
                    "inserted": report.inserted,
                    "failed": report.failed,
                })),
            )?;
            IterationOutcome::Bootstrapped(report)
        }
        Ok(Work::Sync(report)) => {
            // Undrained pulls carry no watermark.
            let watermark = report.pull.watermark.unwrap_or(since);
            state.mark_successful(
                finished,
                Some(json!({
                    PULL_SINCE_KEY: watermark.to_rfc3339(),
                    "drained": report.pull.drained,
                    "pulled": report.pull.received,
                    "applied": report.pull.applied,
                    "conflicts": report.pull.conflicts,
                    "pushed": report.push.pushed,
                    "push_failed": report.push.failed,
                    "push_parked": report.push.parked,
                })),
            )?;
            IterationOutcome::Synced(report)
        }
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Sync attempt failed");
            state.mark_failed(finished, e.to_string(), None)?;
            IterationOutcome::Failed(e.to_string())
        }
    };
    Ok(outcome)
}

fn log_outcome(trigger: Trigger, outcome: &IterationOutcome) {
    match outcome {
        IterationOutcome::Synced(report) => info!(
            ?trigger,
            pulled = report.pull.received,
            pushed = report.push.pushed,
            "Sync iteration complete"
        ),
        IterationOutcome::Bootstrapped(report) => info!(
            ?trigger,
            inserted = report.inserted,
            "Bootstrap iteration complete"
        ),
        IterationOutcome::Failed(message) => warn!(?trigger, error = %message, "Sync iteration failed"),
        IterationOutcome::BreakerOpen | IterationOutcome::InFlight => {
            warn!(?trigger, outcome = ?outcome, "Sync iteration skipped")
        }
        other => debug!(?trigger, outcome = ?other, "Sync iteration skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jukebox_core::{ManualClock, SystemClock};
    use jukebox_db::DbConfig;

    use crate::flags::InMemoryFlags;

    fn state_with(metadata: serde_json::Value) -> SyncTargetState {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut state = SyncTargetState::new(SyncType::Database, PRIMARY_TARGET, now);
        state.metadata = Some(metadata);
        state
    }

    #[test]
    fn test_gate_order() {
        let all = FlagSnapshot {
            enabled: false,
            paused: true,
            emergency_stop: true,
        };
        assert_eq!(gate(&all), Some(IterationOutcome::EmergencyStopped));

        let disabled_and_paused = FlagSnapshot {
            enabled: false,
            paused: true,
            emergency_stop: false,
        };
        assert_eq!(gate(&disabled_and_paused), Some(IterationOutcome::Disabled));

        assert_eq!(gate(&FlagSnapshot::default()), None);
    }

    #[test]
    fn test_pull_since_prefers_watermark() {
        let watermark = "2026-03-01T10:00:00+00:00";
        let mut state = state_with(json!({ PULL_SINCE_KEY: watermark }));
        state.last_success_at = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());

        let since = pull_since(Some(&state), None).unwrap();
        assert_eq!(since, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_pull_since_falls_back_to_bootstrap_time() {
        let initial = state_with(json!({ EXPORTED_AT_KEY: "2026-02-01T00:00:00Z" }));
        let since = pull_since(None, Some(&initial)).unwrap();
        assert_eq!(since, Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());

        assert!(pull_since(None, None).is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = OrchestratorSettings::for_role("node-1", NodeRole::Replica);
        assert_eq!(settings.node_id, "node-1");
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert_eq!(settings.stale_attempt_age, chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_replica_requires_transport() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let result = SyncOrchestrator::new(
            OrchestratorSettings::for_role("r", NodeRole::Replica),
            db,
            None,
            Arc::new(InMemoryFlags::new()),
            Arc::new(SystemClock),
        );
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_standalone_heartbeat_marks_system_target() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orchestrator = SyncOrchestrator::new(
            OrchestratorSettings::for_role("s", NodeRole::Standalone),
            db.clone(),
            None,
            Arc::new(InMemoryFlags::new()),
            clock,
        )
        .unwrap();

        let outcome = orchestrator.run_iteration(Trigger::Forced).await;
        assert_eq!(outcome, IterationOutcome::Heartbeat);

        let state = db
            .sync_status()
            .get(SyncType::Database, SYSTEM_TARGET)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, TargetStatus::Success);
        assert_eq!(state.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_primary_iteration_is_idle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            OrchestratorSettings::for_role("p", NodeRole::Primary),
            db,
            None,
            Arc::new(InMemoryFlags::new()),
            Arc::new(SystemClock),
        )
        .unwrap();

        assert_eq!(
            orchestrator.run_iteration(Trigger::Scheduled).await,
            IterationOutcome::PrimaryIdle
        );
        assert!(!orchestrator.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn test_paused_flag_skips_iteration() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let flags = InMemoryFlags::new();
        let orchestrator = SyncOrchestrator::new(
            OrchestratorSettings::for_role("s", NodeRole::Standalone),
            db.clone(),
            None,
            Arc::new(flags.clone()),
            Arc::new(SystemClock),
        )
        .unwrap();

        orchestrator.pause().await.unwrap();
        assert_eq!(
            orchestrator.run_iteration(Trigger::Scheduled).await,
            IterationOutcome::Paused
        );
        assert!(db.sync_status().list().await.unwrap().is_empty());

        orchestrator.resume().await.unwrap();
        assert_eq!(
            orchestrator.run_iteration(Trigger::Scheduled).await,
            IterationOutcome::Heartbeat
        );
    }
}
