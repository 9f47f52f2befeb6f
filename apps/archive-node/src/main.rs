//! # Archive Node
//!
//! Runs one node of the Jukebox Archive: a primary serving the sync
//! endpoints, a replica syncing with its primary, or a standalone node.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        archive-node serve                               │
//! │                                                                         │
//! │  NodeConfig::load ──► Database::new (migrations) ──► SettingsFlags     │
//! │          │                                                              │
//! │          ├── primary    ──► PrimaryServer::start ──► orchestrator      │
//! │          ├── replica    ──► HttpTransport ──► orchestrator loop        │
//! │          └── standalone ──► orchestrator heartbeat                     │
//! │                                                                         │
//! │  Ctrl+C / SIGTERM ──► orchestrator.stop() ──► server shutdown          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jukebox_core::{Clock, SystemClock};
use jukebox_db::{Database, DbConfig};
use jukebox_sync::{
    ControlFlags, HttpTransport, NodeConfig, NodeRole, OrchestratorSettings, PrimaryServer,
    PrimaryState, SettingsFlags, SyncOrchestrator, SyncTransport, Trigger,
};

#[derive(Debug, Parser)]
#[command(name = "archive-node", version, about = "Jukebox Archive node")]
struct Cli {
    /// Path to node.toml (defaults to the platform config directory)
    #[arg(long, global = true, env = "JUKEBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the node in its configured role until interrupted
    Serve,
    /// Run one forced sync iteration and print the outcome
    SyncOnce,
    /// Issue a key for a replica (prints the secret once)
    IssueKey { node_id: String, name: String },
    /// Deactivate a replica's key
    RevokeKey { node_id: String },
    /// Print orchestrator status and tracker rows as JSON
    Status,
    /// Delete acknowledged change-log entries older than the given age
    Purge {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Flip a runtime switch
    Flags {
        #[command(subcommand)]
        action: FlagAction,
    },
}

#[derive(Debug, Subcommand)]
enum FlagAction {
    Enable,
    Disable,
    Pause,
    Resume,
    EmergencyStop,
    ClearEmergencyStop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,jukebox_sync=debug")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config).context("Failed to load node config")?;

    let db = Database::new(DbConfig::new(&config.database.path))
        .await
        .with_context(|| format!("Failed to open {}", config.database.path.display()))?;

    match cli.command {
        Command::Serve => serve(&config, db).await,
        Command::SyncOnce => {
            let orchestrator = build_orchestrator(&config, db)?;
            let outcome = orchestrator.run_iteration(Trigger::Forced).await;
            println!("{outcome:?}");
            if outcome.is_failure() {
                anyhow::bail!("sync attempt failed");
            }
            Ok(())
        }
        Command::IssueKey { node_id, name } => {
            let secret = db
                .node_keys()
                .issue_key(&node_id, &name, SystemClock.now())
                .await?;
            info!(node_id = %node_id, "Issued node key");
            println!("{secret}");
            Ok(())
        }
        Command::RevokeKey { node_id } => {
            db.node_keys().deactivate(&node_id).await?;
            info!(node_id = %node_id, "Deactivated node key");
            Ok(())
        }
        Command::Status => {
            let orchestrator = build_orchestrator(&config, db)?;
            let report = serde_json::json!({
                "status": orchestrator.status().await?,
                "targets": orchestrator.target_states().await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Purge { days } => {
            let cutoff = SystemClock.now() - chrono::Duration::days(days);
            let purged = db.change_log().purge_acknowledged_before(cutoff).await?;
            info!(purged, cutoff = %cutoff, "Purged acknowledged changes");
            Ok(())
        }
        Command::Flags { action } => {
            let flags = settings_flags(&db);
            match action {
                FlagAction::Enable => flags.set_enabled(true).await?,
                FlagAction::Disable => flags.set_enabled(false).await?,
                FlagAction::Pause => flags.set_paused(true).await?,
                FlagAction::Resume => flags.set_paused(false).await?,
                FlagAction::EmergencyStop => flags.set_emergency_stop(true).await?,
                FlagAction::ClearEmergencyStop => flags.set_emergency_stop(false).await?,
            }
            println!("{}", serde_json::to_string_pretty(&flags.snapshot().await?)?);
            Ok(())
        }
    }
}

async fn serve(config: &NodeConfig, db: Database) -> Result<()> {
    info!(
        node_id = %config.node_id(),
        role = %config.role(),
        "Starting archive node"
    );

    let server = if config.role() == NodeRole::Primary {
        let state = PrimaryState::new(
            config.node_id(),
            db.clone(),
            Arc::new(settings_flags(&db)),
            Arc::new(SystemClock),
        );
        let handle = PrimaryServer::new(config.server.bind_address(), state)
            .start()
            .await?;
        info!(addr = %handle.local_addr(), "Serving sync endpoints");
        Some(handle)
    } else {
        None
    };

    let orchestrator = build_orchestrator(config, db)?;
    orchestrator.start().await?;

    shutdown_signal().await;

    orchestrator.stop().await?;
    if let Some(handle) = server {
        handle.shutdown().await?;
    }

    info!("Archive node stopped");
    Ok(())
}

fn build_orchestrator(config: &NodeConfig, db: Database) -> Result<SyncOrchestrator> {
    let transport = match config.role() {
        NodeRole::Replica => {
            Some(Arc::new(HttpTransport::from_config(config)?) as Arc<dyn SyncTransport>)
        }
        NodeRole::Primary | NodeRole::Standalone => None,
    };
    let flags = Arc::new(settings_flags(&db));

    Ok(SyncOrchestrator::new(
        OrchestratorSettings::from(config),
        db,
        transport,
        flags,
        Arc::new(SystemClock),
    )?)
}

fn settings_flags(db: &Database) -> SettingsFlags {
    SettingsFlags::new(db.settings(), Arc::new(SystemClock))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
