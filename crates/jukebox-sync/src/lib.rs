//! # jukebox-sync: Replication Engine for the Jukebox Archive
//!
//! Keeps the music catalog of several archive nodes convergent. One node is
//! the primary; replicas periodically pull its changes and push their own.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Replication Architecture                         │
//! │                                                                         │
//! │   REPLICA                                      PRIMARY                  │
//! │  ┌─────────────────────────┐                 ┌──────────────────────┐   │
//! │  │ SyncOrchestrator        │                 │ PrimaryServer (Axum) │   │
//! │  │  interval loop, flags,  │                 │                      │   │
//! │  │  breaker, in-flight     │                 │  /sync/changes       │   │
//! │  │  guard, deadline        │                 │  /sync/ack           │   │
//! │  └───────────┬─────────────┘                 │  /sync/apply         │   │
//! │              ▼                               │  /sync/status        │   │
//! │  ┌─────────────────────────┐   HTTP + JSON   │  /sync/initial_data  │   │
//! │  │ ReplicaSession          │────────────────►│                      │   │
//! │  │  pull → resolve → apply │  X-Node-ID      └──────────┬───────────┘   │
//! │  │  push → ack confirmed   │  X-Signature               │               │
//! │  │  bootstrap (first run)  │                            ▼               │
//! │  └───────────┬─────────────┘                 ┌──────────────────────┐   │
//! │              ▼                               │ ApplyEngine          │   │
//! │  ┌─────────────────────────┐                 │ (reassigns ids)      │   │
//! │  │ ConflictAuditor         │                 └──────────────────────┘   │
//! │  │ ApplyEngine (keeps ids) │                                            │
//! │  └─────────────────────────┘                                            │
//! │                                                                         │
//! │  Both sides persist through jukebox-db: change log, acks, tracker       │
//! │  rows, conflict audit, node keys, runtime flags.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`orchestrator`] - `SyncOrchestrator`, the loop and its control surface
//! - [`replica`] - pull, push and bootstrap against one primary
//! - [`server`] - HTTP endpoints served by the primary
//! - [`transport`] - `SyncTransport` trait and the `reqwest` client
//! - [`apply`] - applies one change to catalog storage
//! - [`conflicts`] - conflict resolution plus audit write
//! - [`flags`] - enabled / paused / emergency-stop switches
//! - [`protocol`] - wire types and paths
//! - [`config`] - `NodeConfig` (TOML + environment)
//! - [`error`] - sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jukebox_core::SystemClock;
//! use jukebox_sync::{HttpTransport, NodeConfig, OrchestratorSettings, SettingsFlags, SyncOrchestrator};
//!
//! let config = NodeConfig::load(None)?;
//! let clock = Arc::new(SystemClock);
//! let transport = Arc::new(HttpTransport::from_config(&config)?);
//! let flags = Arc::new(SettingsFlags::new(db.settings(), clock.clone()));
//!
//! let orchestrator = SyncOrchestrator::new(
//!     OrchestratorSettings::from(&config),
//!     db,
//!     Some(transport),
//!     flags,
//!     clock,
//! )?;
//! orchestrator.start().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod apply;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod flags;
pub mod orchestrator;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use apply::{ApplyEngine, ApplyOutcome, IdPolicy};
pub use config::{DatabaseSettings, NodeConfig, NodeRole, NodeSettings, ServerSettings, SyncSettings};
pub use conflicts::ConflictAuditor;
pub use error::{SyncError, SyncResult};
pub use flags::{ControlFlags, FlagSnapshot, InMemoryFlags, SettingsFlags};
pub use orchestrator::{
    ForceSyncAck, IterationOutcome, OrchestratorSettings, OrchestratorStatus, SyncOrchestrator,
    Trigger,
};
pub use replica::{BootstrapReport, PullReport, PushReport, ReplicaSession, SyncReport};
pub use server::{router, AuthenticatedNode, PrimaryHandle, PrimaryServer, PrimaryState};
pub use transport::{HttpTransport, SyncTransport};
