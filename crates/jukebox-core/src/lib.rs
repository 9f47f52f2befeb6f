//! # jukebox-core: Pure Replication Logic
//!
//! Everything the replication engine decides without touching a disk or a
//! socket lives here.
//!
//! ## Module Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          jukebox-core                                   │
//! │                                                                         │
//! │  types.rs      CatalogTable, ChangeKind, ChangeRecord, NewChange        │
//! │  tracking.rs   SyncTargetState machine + retry backoff                  │
//! │  conflict.rs   ConflictResolver (classify + resolve)                    │
//! │  breaker.rs    CircuitBreaker (failure count + cool-down)               │
//! │  clock.rs      Clock port (SystemClock, ManualClock)                    │
//! │  error.rs      CoreError                                                │
//! │                                                                         │
//! │  Callers:                                                               │
//! │  • jukebox-db persists these types                                      │
//! │  • jukebox-sync drives them from the orchestrator                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Time never comes from `Utc::now()` inside this crate: every operation that
//! depends on "now" takes it as an argument, so tests can pin it.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod breaker;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod tracking;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolver, Resolution, ResolutionAction};
pub use error::CoreError;
pub use tracking::{retry_backoff, SyncTargetState, SyncType, TargetStatus};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of changes returned by one change-log query.
///
/// Callers page by re-polling once the previous page is acknowledged.
pub const CHANGES_PAGE_SIZE: u32 = 100;

/// Rejections after which a pushed change is parked instead of re-sent.
pub const MAX_PUSH_REJECTIONS: i64 = 5;

/// Lookback applied when a caller asks for changes without a timestamp.
pub const DEFAULT_LOOKBACK_MINUTES: i64 = 60;

/// A target counts as healthy while its last success is younger than this.
pub const HEALTHY_WINDOW_MINUTES: i64 = 60;

/// Target id a replica uses for its upstream primary.
pub const PRIMARY_TARGET: &str = "primary";

/// Target id used by standalone heartbeats.
pub const SYSTEM_TARGET: &str = "system";
