//! # Core Error Types
//!
//! Domain errors raised by pure replication logic. None of them involve I/O;
//! the database and sync crates wrap them in their own error enums.

use thiserror::Error;

use crate::tracking::TargetStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Errors from the pure replication domain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A state-machine transition that is not in the transition table.
    ///
    /// ## When This Occurs
    /// - `mark_in_progress` on a target already `in_progress` (in-flight guard)
    /// - `mark_successful` / `mark_failed` on a target that is not `in_progress`
    #[error("Invalid transition for {target}: cannot {action} while {from}")]
    InvalidTransition {
        target: String,
        from: TargetStatus,
        action: &'static str,
    },

    /// Table name is not one of the replicated catalog tables.
    #[error("Unknown catalog table: {0}")]
    UnknownTable(String),

    /// Change kind is not create, update or delete.
    #[error("Unknown change kind: {0}")]
    UnknownChangeKind(String),

    /// Sync type is not database, file or initial.
    #[error("Unknown sync type: {0}")]
    UnknownSyncType(String),

    /// A create or update arrived without an object payload.
    #[error("Change {change_kind} on {table}/{entity_id} has no object payload")]
    MissingPayload {
        table: String,
        entity_id: String,
        change_kind: String,
    },
}

impl CoreError {
    /// Returns true for the in-flight guard case, which callers treat as a
    /// skip rather than a failure.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidTransition {
                from: TargetStatus::InProgress,
                action: "start",
                ..
            }
        )
    }
}
