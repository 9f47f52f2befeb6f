//! # Sync Target State Machine
//!
//! One [`SyncTargetState`] exists per `(sync_type, target_id)` pair and
//! records every attempt made against that target.
//!
//! ## Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │     idle ─────┐                                                         │
//! │     success ──┼── mark_in_progress ──►  in_progress                     │
//! │     failed ───┘   attempt_count += 1        │                           │
//! │                   last_attempt_at = now     │                           │
//! │                                             ├── mark_successful ──► success
//! │                                             │   last_success_at = now  │
//! │                                             │   error cleared          │
//! │                                             │                           │
//! │                                             └── mark_failed ──────► failed
//! │                                                 next_attempt_at =      │
//! │                                                 retry_after or backoff │
//! │                                                                         │
//! │  in_progress ── mark_in_progress ──► InvalidTransition (in flight)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backoff
//! `min(2^(attempt_count - 1), 30)` minutes: 1, 2, 4, 8, 16, 30, 30, ...

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::CoreError;
use crate::HEALTHY_WINDOW_MINUTES;

/// Cap on the retry backoff, in minutes.
pub const MAX_BACKOFF_MINUTES: i64 = 30;

// =============================================================================
// Sync Type
// =============================================================================

/// What kind of synchronization a tracker row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncType {
    /// Regular pull/push of change records.
    Database,
    /// Media file transfer (tracked, not driven by this engine).
    File,
    /// Full bootstrap snapshot.
    Initial,
}

impl SyncType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncType::Database => "database",
            SyncType::File => "file",
            SyncType::Initial => "initial",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(SyncType::Database),
            "file" => Ok(SyncType::File),
            "initial" => Ok(SyncType::Initial),
            other => Err(CoreError::UnknownSyncType(other.to_string())),
        }
    }
}

// =============================================================================
// Target Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum TargetStatus {
    #[default]
    Idle,
    InProgress,
    Success,
    Failed,
}

impl TargetStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Idle => "idle",
            TargetStatus::InProgress => "in_progress",
            TargetStatus::Success => "success",
            TargetStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Retry delay after the given number of attempts.
///
/// ## Schedule
/// ```text
/// attempt_count:  1   2   3   4   5    6    7 ...
/// minutes:        1   2   4   8   16   30   30
/// ```
pub fn retry_backoff(attempt_count: i64) -> Duration {
    let exponent = (attempt_count - 1).max(0);

    // 2^5 already exceeds the cap, so larger exponents never need computing.
    let minutes = if exponent >= 5 {
        MAX_BACKOFF_MINUTES
    } else {
        (1_i64 << exponent).min(MAX_BACKOFF_MINUTES)
    };

    Duration::minutes(minutes)
}

// =============================================================================
// Sync Target State
// =============================================================================

/// Retry and health state for one `(sync_type, target_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncTargetState {
    /// What is being synchronized.
    pub sync_type: SyncType,

    /// Remote node (or `"system"` for standalone heartbeats).
    pub target_id: String,

    pub status: TargetStatus,

    /// Attempts started over the lifetime of this row.
    pub attempt_count: i64,

    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub last_success_at: Option<DateTime<Utc>>,

    /// Earliest time a failed target should be retried.
    #[ts(as = "Option<String>")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,

    /// Free-form details of the last successful attempt.
    pub metadata: Option<Value>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl SyncTargetState {
    /// A fresh, never-attempted target.
    pub fn new(sync_type: SyncType, target_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        SyncTargetState {
            sync_type,
            target_id: target_id.into(),
            status: TargetStatus::Idle,
            attempt_count: 0,
            last_attempt_at: None,
            last_success_at: None,
            next_attempt_at: None,
            error_message: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn invalid(&self, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            target: format!("{}/{}", self.sync_type, self.target_id),
            from: self.status,
            action,
        }
    }

    /// Starts an attempt.
    ///
    /// ## Errors
    /// `InvalidTransition` if an attempt is already in flight.
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status == TargetStatus::InProgress {
            return Err(self.invalid("start"));
        }

        self.status = TargetStatus::InProgress;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Completes the in-flight attempt successfully.
    pub fn mark_successful(
        &mut self,
        now: DateTime<Utc>,
        metadata: Option<Value>,
    ) -> Result<(), CoreError> {
        if self.status != TargetStatus::InProgress {
            return Err(self.invalid("succeed"));
        }

        self.status = TargetStatus::Success;
        self.last_success_at = Some(now);
        self.error_message = None;
        self.metadata = metadata;
        self.updated_at = now;
        Ok(())
    }

    /// Fails the in-flight attempt and schedules the next one.
    ///
    /// `retry_after` overrides the computed backoff when the remote side
    /// asked for a specific time.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        error: impl Into<String>,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        if self.status != TargetStatus::InProgress {
            return Err(self.invalid("fail"));
        }

        self.status = TargetStatus::Failed;
        self.error_message = Some(error.into());
        self.next_attempt_at =
            Some(retry_after.unwrap_or_else(|| now + retry_backoff(self.attempt_count)));
        self.updated_at = now;
        Ok(())
    }

    /// Operator reset: forgets a failure without claiming a new success.
    pub fn clear_failure(&mut self, now: DateTime<Utc>) {
        if self.status == TargetStatus::Failed {
            self.status = TargetStatus::Idle;
            self.error_message = None;
            self.next_attempt_at = None;
            self.updated_at = now;
        }
    }

    /// True when a failed target's backoff has elapsed.
    pub fn should_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == TargetStatus::Failed
            && self.next_attempt_at.is_some_and(|next| next <= now)
    }

    pub fn time_since_last_success(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_success_at.map(|at| now - at)
    }

    /// True when the last success is less than an hour old.
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.time_since_last_success(now)
            .is_some_and(|age| age < Duration::minutes(HEALTHY_WINDOW_MINUTES))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
