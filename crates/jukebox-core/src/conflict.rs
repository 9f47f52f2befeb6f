//! # Conflict Resolution
//!
//! Decides what happens when a local change and a remote change touch the
//! same entity. The decision is pure; writing the audit row is the caller's
//! job (see `jukebox-sync::conflicts`).
//!
//! ## Decision Table
//! ```text
//! ┌──────────┬──────────┬───────────────────────┬───────────────────────────┐
//! │ local    │ remote   │ kind                  │ winner                    │
//! ├──────────┼──────────┼───────────────────────┼───────────────────────────┤
//! │ update   │ update   │ simultaneous_update   │ later created_at          │
//! │          │          │                       │ (tie → remote)            │
//! │ delete   │ update   │ deletion_vs_update    │ the delete                │
//! │ update   │ delete   │ deletion_vs_update    │ the delete                │
//! │ delete   │ delete   │ simultaneous_deletion │ remote (no-op either way) │
//! │ create   │ update   │ creation_vs_update    │ the create                │
//! │ update   │ create   │ creation_vs_update    │ the create                │
//! │ other    │ other    │ no_conflict           │ none                      │
//! └──────────┴──────────┴───────────────────────┴───────────────────────────┘
//! ```
//!
//! "Remote" is the primary's side when a replica pulls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{ChangeKind, ChangeRecord};

// =============================================================================
// Conflict Kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConflictKind {
    SimultaneousUpdate,
    DeletionVsUpdate,
    SimultaneousDeletion,
    CreationVsUpdate,
    NoConflict,
}

impl ConflictKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::SimultaneousUpdate => "simultaneous_update",
            ConflictKind::DeletionVsUpdate => "deletion_vs_update",
            ConflictKind::SimultaneousDeletion => "simultaneous_deletion",
            ConflictKind::CreationVsUpdate => "creation_vs_update",
            ConflictKind::NoConflict => "no_conflict",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Which side of a conflict gets applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ResolutionAction {
    /// Keep the local change; the remote one is dropped.
    ApplyLocal,
    /// Apply the remote change; the local one is superseded.
    ApplyRemote,
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionAction::ApplyLocal => f.write_str("apply_local"),
            ResolutionAction::ApplyRemote => f.write_str("apply_remote"),
        }
    }
}

/// Outcome of resolving one conflicting pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub kind: ConflictKind,
    pub action: ResolutionAction,
    /// Human-readable explanation, stored in the audit log.
    pub reason: String,
}

impl Resolution {
    pub fn remote_wins(&self) -> bool {
        self.action == ResolutionAction::ApplyRemote
    }

    /// The winning change of the pair this resolution was computed for.
    pub fn winner<'a>(&self, local: &'a ChangeRecord, remote: &'a ChangeRecord) -> &'a ChangeRecord {
        match self.action {
            ResolutionAction::ApplyLocal => local,
            ResolutionAction::ApplyRemote => remote,
        }
    }
}

/// Audit row written for every resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub conflict_kind: ConflictKind,
    pub local_change: ChangeRecord,
    pub remote_change: ChangeRecord,
    pub resolution: ResolutionAction,
    pub reason: String,
    pub resolved_at: DateTime<Utc>,
}

// =============================================================================
// Conflict Resolver
// =============================================================================

/// Stateless conflict decision function.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Classifies a pair by change kinds alone.
    pub fn classify(local: ChangeKind, remote: ChangeKind) -> ConflictKind {
        use ChangeKind::*;

        match (local, remote) {
            (Update, Update) => ConflictKind::SimultaneousUpdate,
            (Delete, Update) | (Update, Delete) => ConflictKind::DeletionVsUpdate,
            (Delete, Delete) => ConflictKind::SimultaneousDeletion,
            (Create, Update) | (Update, Create) => ConflictKind::CreationVsUpdate,
            _ => ConflictKind::NoConflict,
        }
    }

    /// Resolves a pair of changes.
    ///
    /// Returns `None` when the records refer to different entities or the
    /// pair is not a conflict.
    pub fn resolve(local: &ChangeRecord, remote: &ChangeRecord) -> Option<Resolution> {
        if !local.same_entity(remote) {
            return None;
        }

        let kind = Self::classify(local.change_kind, remote.change_kind);

        let (action, reason) = match kind {
            ConflictKind::NoConflict => return None,

            ConflictKind::SimultaneousUpdate => {
                if local.created_at > remote.created_at {
                    (
                        ResolutionAction::ApplyLocal,
                        format!(
                            "Local change is more recent ({} vs {})",
                            local.created_at.to_rfc3339(),
                            remote.created_at.to_rfc3339()
                        ),
                    )
                } else {
                    (
                        ResolutionAction::ApplyRemote,
                        format!(
                            "Remote change is at least as recent ({} vs {})",
                            remote.created_at.to_rfc3339(),
                            local.created_at.to_rfc3339()
                        ),
                    )
                }
            }

            ConflictKind::DeletionVsUpdate => {
                if remote.change_kind == ChangeKind::Delete {
                    (
                        ResolutionAction::ApplyRemote,
                        "Remote deletion takes precedence over local update".to_string(),
                    )
                } else {
                    (
                        ResolutionAction::ApplyLocal,
                        "Local deletion takes precedence over remote update".to_string(),
                    )
                }
            }

            ConflictKind::SimultaneousDeletion => (
                ResolutionAction::ApplyRemote,
                "Both sides deleted the same record; using remote deletion".to_string(),
            ),

            ConflictKind::CreationVsUpdate => {
                if remote.change_kind == ChangeKind::Create {
                    (
                        ResolutionAction::ApplyRemote,
                        "Remote creation takes precedence over local update".to_string(),
                    )
                } else {
                    (
                        ResolutionAction::ApplyLocal,
                        "Local creation takes precedence over remote update".to_string(),
                    )
                }
            }
        };

        Some(Resolution {
            kind,
            action,
            reason,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
