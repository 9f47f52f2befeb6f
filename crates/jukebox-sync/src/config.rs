//! # Node Configuration
//!
//! Configuration management for a jukebox node.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     JUKEBOX_ROLE=replica                                               │
//! │     JUKEBOX_PRIMARY_URL=http://10.0.0.2:8787                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/jukebox-archive/node.toml (Linux)                        │
//! │     ~/Library/Application Support/org.jukebox.archive/node.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     NodeRole::Standalone, auto-generated node id                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The runtime switches (enabled / paused / emergency stop) are not here:
//! they live in `system_settings` so the admin UI can flip them while the
//! node runs. See [`crate::flags`].
//!
//! ## Configuration File Format
//! ```toml
//! # node.toml
//! [node]
//! id = "replica-basement"
//! name = "Basement jukebox"
//! role = "replica"            # primary | replica | standalone
//!
//! [sync]
//! primary_url = "http://10.0.0.2:8787"
//! secret = "…"                # from `archive-node issue-key` on the primary
//! interval_secs = 300
//! attempt_timeout_secs = 30
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8787
//!
//! [database]
//! path = "/var/lib/jukebox/archive.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Node Role
// =============================================================================

/// What this node does in the replication topology.
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                          Node Roles                                     │
/// │                                                                         │
/// │  PRIMARY                                                               │
/// │  • Serves /sync/* endpoints to replicas                                │
/// │  • Never initiates sync itself                                         │
/// │                                                                         │
/// │  REPLICA                                                               │
/// │  • Pulls from and pushes to one primary on a schedule                  │
/// │  • May bootstrap from a full snapshot on first sync                    │
/// │                                                                         │
/// │  STANDALONE (Default)                                                  │
/// │  • No network activity; a heartbeat keeps status healthy               │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Replica,
    #[default]
    Standalone,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
            NodeRole::Standalone => write!(f, "standalone"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" | "master" => Ok(NodeRole::Primary),
            "replica" | "slave" => Ok(NodeRole::Replica),
            "standalone" => Ok(NodeRole::Standalone),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown node role: '{}'. Valid options: primary, replica, standalone",
                other
            ))),
        }
    }
}

// =============================================================================
// Node Identity
// =============================================================================

/// Identity of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Identifier presented to the primary as `X-Node-ID`.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable node name.
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default)]
    pub role: NodeRole,
}

fn default_node_name() -> String {
    "Jukebox".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            id: Uuid::new_v4().to_string(),
            name: default_node_name(),
            role: NodeRole::default(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Replication behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Base URL of the primary (replicas only).
    #[serde(default)]
    pub primary_url: Option<String>,

    /// Shared secret issued by the primary (replicas only).
    #[serde(default)]
    pub secret: Option<String>,

    /// Time between scheduled iterations.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Hard deadline for one pull+push attempt.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Page size the primary serves; a shorter page ends the pull.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on pages pulled in one attempt.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Consecutive failures that open the circuit breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long an open breaker skips attempts.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Replace the local catalog with a snapshot of the primary the first
    /// time a replica syncs.
    #[serde(default = "default_true")]
    pub bootstrap_on_first_sync: bool,
}

fn default_interval() -> u64 {
    300
}
fn default_attempt_timeout() -> u64 {
    30
}
fn default_batch_size() -> usize {
    100
}
fn default_max_pages() -> usize {
    20
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    20
}
fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            primary_url: None,
            secret: None,
            interval_secs: default_interval(),
            attempt_timeout_secs: default_attempt_timeout(),
            batch_size: default_batch_size(),
            max_pages: default_max_pages(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            bootstrap_on_first_sync: default_true(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Listener for the primary's HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("org", "jukebox", "archive")
        .map(|dirs| dirs.data_dir().join("archive.db"))
        .unwrap_or_else(|| PathBuf::from("archive.db"))
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

// =============================================================================
// Main Node Configuration
// =============================================================================

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl NodeConfig {
    /// Creates a new config with defaults and a generated node ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (node.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading node config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Node config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.id.trim().is_empty() {
            return Err(SyncError::MissingNodeId);
        }

        if let Some(ref url) = self.sync.primary_url {
            let parsed = Url::parse(url)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "Primary URL must start with http:// or https://, got: {}",
                    url
                )));
            }
        }

        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.attempt_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "attempt_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.batch_size == 0 || self.sync.max_pages == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size and max_pages must be greater than 0".into(),
            ));
        }

        if self.node.role == NodeRole::Replica {
            if self.sync.primary_url.is_none() {
                return Err(SyncError::InvalidConfig(
                    "replica role requires sync.primary_url".into(),
                ));
            }
            if self.sync.secret.as_deref().map_or(true, str::is_empty) {
                return Err(SyncError::InvalidConfig(
                    "replica role requires sync.secret".into(),
                ));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any variable source.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("JUKEBOX_NODE_ID") {
            debug!(node_id = %id, "Overriding node ID from environment");
            self.node.id = id;
        }

        if let Some(role) = var("JUKEBOX_ROLE") {
            match role.parse() {
                Ok(parsed) => {
                    debug!(role = %role, "Overriding node role from environment");
                    self.node.role = parsed;
                }
                Err(_) => warn!(role = %role, "Unknown node role in environment"),
            }
        }

        if let Some(url) = var("JUKEBOX_PRIMARY_URL") {
            debug!(url = %url, "Overriding primary URL from environment");
            self.sync.primary_url = Some(url);
        }

        if let Some(secret) = var("JUKEBOX_NODE_SECRET") {
            self.sync.secret = Some(secret);
        }

        if let Some(interval) = var("JUKEBOX_SYNC_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(secs) => self.sync.interval_secs = secs,
                Err(_) => warn!(value = %interval, "Ignoring non-numeric sync interval"),
            }
        }

        if let Some(addr) = var("JUKEBOX_BIND_ADDR") {
            self.server.bind_addr = addr;
        }

        if let Some(port) = var("JUKEBOX_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding server port from environment");
                self.server.port = p;
            }
        }

        if let Some(path) = var("JUKEBOX_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "jukebox", "archive")
            .map(|dirs| dirs.config_dir().join("node.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn role(&self) -> NodeRole {
        self.node.role
    }

    pub fn primary_url(&self) -> Option<&str> {
        self.sync.primary_url.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn replica_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.role = NodeRole::Replica;
        config.sync.primary_url = Some("http://10.0.0.2:8787".into());
        config.sync.secret = Some("s3cret".into());
        config
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("primary".parse::<NodeRole>().unwrap(), NodeRole::Primary);
        assert_eq!("master".parse::<NodeRole>().unwrap(), NodeRole::Primary);
        assert_eq!("slave".parse::<NodeRole>().unwrap(), NodeRole::Replica);
        assert_eq!("Standalone".parse::<NodeRole>().unwrap(), NodeRole::Standalone);
        assert!("hub".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(!config.node.id.is_empty());
        assert_eq!(config.node.role, NodeRole::Standalone);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.attempt_timeout_secs, 30);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.breaker_threshold, 5);
        assert_eq!(config.server.bind_address(), "0.0.0.0:8787");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = replica_config();
        assert!(config.validate().is_ok());

        config.sync.secret = None;
        assert!(config.validate().is_err());

        config = replica_config();
        config.sync.primary_url = Some("ws://10.0.0.2".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.sync.primary_url = Some("not a url".into());
        assert!(config.validate().is_err());

        config = replica_config();
        config.sync.interval_secs = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config = replica_config();
        config.node.id = "  ".into();
        assert!(matches!(config.validate(), Err(SyncError::MissingNodeId)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("JUKEBOX_NODE_ID", "replica-7"),
            ("JUKEBOX_ROLE", "slave"),
            ("JUKEBOX_PRIMARY_URL", "https://archive.example.org"),
            ("JUKEBOX_NODE_SECRET", "abc"),
            ("JUKEBOX_SYNC_INTERVAL_SECS", "60"),
            ("JUKEBOX_PORT", "9000"),
            ("JUKEBOX_DATABASE", "/tmp/x.db"),
        ]);

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.node_id(), "replica-7");
        assert_eq!(config.role(), NodeRole::Replica);
        assert_eq!(config.primary_url(), Some("https://archive.example.org"));
        assert_eq!(config.sync.secret.as_deref(), Some("abc"));
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.toml");

        let config = replica_config();
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[node]"));
        assert!(contents.contains("role = \"replica\""));

        let loaded: NodeConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.node.id, config.node.id);
        assert_eq!(loaded.primary_url(), config.primary_url());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [node]
            id = "primary-1"
            role = "primary"
            "#,
        )
        .unwrap();

        assert_eq!(config.role(), NodeRole::Primary);
        assert_eq!(config.sync.max_pages, 20);
        assert!(config.sync.bootstrap_on_first_sync);
    }
}
