//! shelfsync daemon entry point.
//!
//! Loads configuration, opens the local mirror, starts the sync scheduler,
//! and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::remote::{RemoteClient, RestRemote};
use shelfsync_core::sync_engine::SyncEngine;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// shelfsync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "shelfsync-daemon",
    version,
    about = "Offline-first library data synchronization daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  shelfsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Remote URL    : {}", config.remote.url);
    info!("Tables        : {}", config.sync.tables.join(", "));
    info!("Push mode     : {}", config.sync.push_mode);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    let remote: Arc<dyn RemoteClient> =
        Arc::new(RestRemote::new(&config.remote).context("failed to build remote client")?);

    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let engine = SyncEngine::new(config, Arc::new(db), remote)
        .context("failed to initialize sync engine")?;

    let pending = engine.db().count_pending(None).unwrap_or(0);
    if pending > 0 {
        info!(pending, "local changes waiting to be pushed");
    }

    // Manual sync trigger (SIGUSR1 -> scheduler)
    let (sync_tx, sync_rx) = tokio::sync::mpsc::channel::<()>(16);
    let trigger_handle = tokio::spawn(signals::forward_sync_requests(sync_tx));

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let mut sched = scheduler::Scheduler::new(engine.clone(), poll_interval, sync_rx);
    let scheduler_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            sched.run(shutdown).await;
        })
    };

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // Stop any in-flight cycle at its next checkpoint; cursors stay put.
    engine.cancel();
    shutdown.notify_one();

    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }
    trigger_handle.abort();

    info!("shelfsync daemon stopped.");
    Ok(())
}
