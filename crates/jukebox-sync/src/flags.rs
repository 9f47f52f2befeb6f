//! # Control Flags
//!
//! The runtime switches the orchestrator reads once per iteration.
//!
//! ```text
//! admin UI ──► set_paused(true) ──► system_settings.sync_paused = "true"
//!                                              │
//! orchestrator loop ──► flags.snapshot() ◄─────┘  (next iteration)
//! ```
//!
//! [`SettingsFlags`] persists them in `system_settings` so they survive a
//! restart and are shared with other processes on the same database.
//! [`InMemoryFlags`] is for embedding and tests.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use jukebox_core::Clock;
use jukebox_db::{SettingsRepository, SYNC_EMERGENCY_STOP, SYNC_ENABLED, SYNC_PAUSED};

use crate::error::SyncResult;

/// Values of all flags at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub enabled: bool,
    pub paused: bool,
    pub emergency_stop: bool,
}

impl Default for FlagSnapshot {
    fn default() -> Self {
        FlagSnapshot {
            enabled: true,
            paused: false,
            emergency_stop: false,
        }
    }
}

/// Source of the runtime switches.
#[async_trait]
pub trait ControlFlags: Send + Sync {
    async fn snapshot(&self) -> SyncResult<FlagSnapshot>;
    async fn set_enabled(&self, enabled: bool) -> SyncResult<()>;
    async fn set_paused(&self, paused: bool) -> SyncResult<()>;
    async fn set_emergency_stop(&self, stopped: bool) -> SyncResult<()>;
}

// =============================================================================
// Settings-backed flags
// =============================================================================

/// Flags stored in the `system_settings` table.
pub struct SettingsFlags {
    settings: SettingsRepository,
    clock: Arc<dyn Clock>,
}

impl SettingsFlags {
    pub fn new(settings: SettingsRepository, clock: Arc<dyn Clock>) -> Self {
        SettingsFlags { settings, clock }
    }
}

#[async_trait]
impl ControlFlags for SettingsFlags {
    async fn snapshot(&self) -> SyncResult<FlagSnapshot> {
        Ok(FlagSnapshot {
            enabled: self.settings.get_bool(SYNC_ENABLED, true).await?,
            paused: self.settings.get_bool(SYNC_PAUSED, false).await?,
            emergency_stop: self.settings.get_bool(SYNC_EMERGENCY_STOP, false).await?,
        })
    }

    async fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        Ok(self.settings.set_bool(SYNC_ENABLED, enabled, self.clock.now()).await?)
    }

    async fn set_paused(&self, paused: bool) -> SyncResult<()> {
        Ok(self.settings.set_bool(SYNC_PAUSED, paused, self.clock.now()).await?)
    }

    async fn set_emergency_stop(&self, stopped: bool) -> SyncResult<()> {
        Ok(self
            .settings
            .set_bool(SYNC_EMERGENCY_STOP, stopped, self.clock.now())
            .await?)
    }
}

// =============================================================================
// In-memory flags
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct InMemoryFlags {
    inner: Arc<RwLock<FlagSnapshot>>,
}

impl InMemoryFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlFlags for InMemoryFlags {
    async fn snapshot(&self) -> SyncResult<FlagSnapshot> {
        Ok(*self.inner.read().await)
    }

    async fn set_enabled(&self, enabled: bool) -> SyncResult<()> {
        self.inner.write().await.enabled = enabled;
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> SyncResult<()> {
        self.inner.write().await.paused = paused;
        Ok(())
    }

    async fn set_emergency_stop(&self, stopped: bool) -> SyncResult<()> {
        self.inner.write().await.emergency_stop = stopped;
        Ok(())
    }
}
