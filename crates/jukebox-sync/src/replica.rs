//! # Replica Session
//!
//! One replica's exchange with its primary: pull, push, and the one-time
//! bootstrap.
//!
//! ## Pull
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              PULL                                       │
//! │                                                                         │
//! │  fetch_changes(since) ──► page of ≤ batch_size WireChanges              │
//! │       │                                                                 │
//! │       │  for each change:                                              │
//! │       │    local = pending_for_key(table, id, "primary")               │
//! │       │    ├─ no local change        → apply remote                    │
//! │       │    ├─ conflict, remote wins  → apply remote, ack every         │
//! │       │    │                           local change to the key          │
//! │       │    └─ conflict, local wins   → keep local, skip remote         │
//! │       ▼                                                                 │
//! │  acknowledge(every consumed id)   (applied, skipped or failed)         │
//! │       │                                                                 │
//! │       └─ page shorter than batch_size? drained : fetch again           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push
//! Local changes not yet acknowledged for `"primary"` go out in one batch.
//! Only ids the primary lists in `applied_ids` are acknowledged; the rest
//! stay pending for the next attempt. Each refusal is counted: refused
//! changes queue behind fresh ones, and after [`MAX_PUSH_REJECTIONS`]
//! refusals a change is parked and no longer sent.
//!
//! Changes applied from a pull are never written to this node's own change
//! log, so they are never pushed back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use jukebox_core::{CatalogTable, Clock, MAX_PUSH_REJECTIONS, PRIMARY_TARGET};
use jukebox_db::repository::catalog;
use jukebox_db::{mark_key_applied_on, Database};

use crate::apply::{ApplyEngine, ApplyOutcome, IdPolicy};
use crate::conflicts::ConflictAuditor;
use crate::error::SyncResult;
use crate::protocol::{PushedChange, WireChange};
use crate::transport::SyncTransport;

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub pages: usize,
    pub received: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// The last page was short, so nothing newer was left on the primary.
    pub drained: bool,
    /// Primary clock reading of the first page, set only when the pull
    /// drained; the next pull starts here.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub pushed: usize,
    pub applied: usize,
    pub failed: usize,
    /// Changes that reached the rejection limit in this push.
    pub parked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pull: PullReport,
    pub push: PushReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub inserted: usize,
    pub failed: usize,
    pub exported_at: DateTime<Utc>,
}

/// What happened to one pulled change.
enum PullItem {
    Applied,
    Skipped,
    ConflictRemoteWon,
    ConflictLocalWon,
}

// =============================================================================
// Session
// =============================================================================

/// Pull/push/bootstrap against one primary.
#[derive(Clone)]
pub struct ReplicaSession {
    db: Database,
    transport: Arc<dyn SyncTransport>,
    clock: Arc<dyn Clock>,
    auditor: ConflictAuditor,
    batch_size: usize,
    max_pages: usize,
}

impl ReplicaSession {
    pub fn new(
        db: Database,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        max_pages: usize,
    ) -> Self {
        let auditor = ConflictAuditor::new(db.conflict_log());
        ReplicaSession {
            db,
            transport,
            clock,
            auditor,
            batch_size: batch_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// Pull then push.
    pub async fn sync(&self, since: DateTime<Utc>) -> SyncResult<SyncReport> {
        let pull = self.pull(since).await?;
        let push = self.push().await?;
        Ok(SyncReport { pull, push })
    }

    /// Pulls every page of primary changes after `since`.
    ///
    /// ## Errors
    /// Transport failures abort the pull. Per-change apply failures are
    /// counted in the report and the change is still acknowledged.
    pub async fn pull(&self, since: DateTime<Utc>) -> SyncResult<PullReport> {
        let mut report = PullReport::default();
        let mut engine = ApplyEngine::new(IdPolicy::Preserve);
        let mut first_page_time = None;

        while report.pages < self.max_pages {
            let page = self.transport.fetch_changes(since).await?;
            report.pages += 1;
            first_page_time.get_or_insert(page.current_time);

            let page_len = page.changes.len();
            debug!(page = report.pages, count = page_len, "Received change page");

            let mut consumed = Vec::with_capacity(page_len);
            for wire in &page.changes {
                consumed.push(wire.id.clone());
                report.received += 1;

                match self.consume(&mut engine, wire).await {
                    Ok(PullItem::Applied) => report.applied += 1,
                    Ok(PullItem::Skipped) => report.skipped += 1,
                    Ok(PullItem::ConflictRemoteWon) => {
                        report.conflicts += 1;
                        report.applied += 1;
                    }
                    Ok(PullItem::ConflictLocalWon) => {
                        report.conflicts += 1;
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(change_id = %wire.id, error = %e, "Failed to apply pulled change");
                        report.failed += 1;
                    }
                }
            }

            if !consumed.is_empty() {
                self.transport.acknowledge(consumed).await?;
            }

            if page_len < self.batch_size {
                report.drained = true;
                break;
            }
        }

        // A backlog left behind by max_pages still sits at or before the
        // first page's time; keep `since` until it is gone.
        if report.drained {
            report.watermark = first_page_time;
        } else {
            warn!(pages = report.pages, "Pull stopped at page limit, backlog remains");
        }

        info!(
            pages = report.pages,
            drained = report.drained,
            received = report.received,
            applied = report.applied,
            conflicts = report.conflicts,
            failed = report.failed,
            "Pull complete"
        );
        Ok(report)
    }

    async fn consume(&self, engine: &mut ApplyEngine, wire: &WireChange) -> SyncResult<PullItem> {
        let remote = wire.to_record()?;
        let now = self.clock.now();

        let local = self
            .db
            .change_log()
            .pending_for_key(remote.entity_table, &remote.entity_id, PRIMARY_TARGET)
            .await?;

        let mut superseded = false;
        if let Some(local) = local {
            if let Some(resolution) = self.auditor.resolve(&local, &remote, now).await? {
                if !resolution.remote_wins() {
                    return Ok(PullItem::ConflictLocalWon);
                }
                superseded = true;
            }
        }

        let mut tx = self.db.begin().await?;
        let outcome = engine.apply(&mut tx, &remote, now).await?;
        if superseded {
            // Every older local edit of the key lost too, not just the latest.
            let acked = mark_key_applied_on(
                &mut tx,
                remote.entity_table,
                &remote.entity_id,
                PRIMARY_TARGET,
                now,
            )
            .await?;
            debug!(
                table = %remote.entity_table,
                entity_id = %remote.entity_id,
                acked,
                "Superseded local changes"
            );
        }
        tx.commit().await?;

        Ok(match (superseded, outcome) {
            (true, _) => PullItem::ConflictRemoteWon,
            (false, ApplyOutcome::Skipped { .. }) => PullItem::Skipped,
            (false, _) => PullItem::Applied,
        })
    }

    /// Pushes local changes the primary has not confirmed.
    pub async fn push(&self) -> SyncResult<PushReport> {
        let change_log = self.db.change_log();
        let pending = change_log
            .pushable_for_target(PRIMARY_TARGET, self.batch_size as u32)
            .await?;

        if pending.is_empty() {
            debug!("Nothing to push");
            return Ok(PushReport::default());
        }

        let batch: Vec<PushedChange> = pending.iter().map(PushedChange::from).collect();
        let response = self.transport.push_changes(batch).await?;

        let sent: HashSet<&str> = pending.iter().map(|c| c.id.as_str()).collect();
        let now = self.clock.now();
        for id in response.applied_ids.iter().filter(|id| sent.contains(id.as_str())) {
            change_log.mark_applied_by_target(id, PRIMARY_TARGET, now).await?;
        }

        let mut parked = 0;
        for rejected in &response.errors {
            warn!(
                change_id = rejected.change.id.as_deref().unwrap_or("-"),
                table = %rejected.change.table,
                error = %rejected.error,
                "Primary rejected pushed change"
            );

            let Some(id) = rejected.change.id.as_deref().filter(|id| sent.contains(id)) else {
                continue;
            };
            let attempts = change_log
                .record_rejection(id, PRIMARY_TARGET, &rejected.error, now)
                .await?;
            if attempts == Some(MAX_PUSH_REJECTIONS) {
                warn!(change_id = %id, "Parking change after repeated rejections");
                parked += 1;
            }
        }

        let report = PushReport {
            pushed: pending.len(),
            applied: response.applied_count,
            failed: response.error_count,
            parked,
        };
        info!(
            pushed = report.pushed,
            applied = report.applied,
            failed = report.failed,
            parked = report.parked,
            "Push complete"
        );
        Ok(report)
    }

    /// Replaces the local catalog with the primary's snapshot.
    ///
    /// Runs in one transaction: tables are cleared children-first, then
    /// rows are inserted parents-first under fresh ids with foreign keys
    /// rewritten to match.
    pub async fn bootstrap(&self) -> SyncResult<BootstrapReport> {
        let snapshot = self.transport.fetch_initial_data().await?;
        let now = self.clock.now();

        info!(
            total_records = snapshot.total_records,
            exported_at = %snapshot.exported_at,
            "Bootstrapping from primary snapshot"
        );

        let mut tx = self.db.begin().await?;

        if snapshot.clear_existing {
            for table in CatalogTable::DEPENDENCY_ORDER.iter().rev() {
                let cleared = catalog::clear_table(&mut tx, *table).await?;
                debug!(table = %table, cleared, "Cleared table");
            }
        }

        let mut engine = ApplyEngine::new(IdPolicy::Reassign);
        let mut inserted = 0;
        let mut failed = 0;

        for table in CatalogTable::DEPENDENCY_ORDER {
            for row in snapshot.records(table) {
                match engine.insert_snapshot_row(&mut tx, table, row, now).await {
                    Ok(_) => inserted += 1,
                    Err(e) => {
                        warn!(table = %table, error = %e, "Skipping snapshot row");
                        failed += 1;
                    }
                }
            }
        }

        tx.commit().await?;

        info!(inserted, failed, "Bootstrap complete");
        Ok(BootstrapReport {
            inserted,
            failed,
            exported_at: snapshot.exported_at,
        })
    }
}

impl std::fmt::Debug for ReplicaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSession")
            .field("batch_size", &self.batch_size)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}
