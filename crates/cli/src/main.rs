//! shelfsync command-line management tool.
//!
//! Provides subcommands for generating and validating configuration,
//! inspecting per-table sync status and the pending change queue, running
//! a sync cycle on demand, browsing the audit log, forcing a full resync of
//! one table, and checking the health of a local installation.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::remote::{RemoteClient, RestRemote};
use shelfsync_core::sync_engine::SyncEngine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// shelfsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "shelfsync",
    version,
    about = "Manage and inspect an offline library data mirror"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/shelfsync/config.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./shelfsync.toml")]
        output: PathBuf,

        /// Write the defaults without prompting.
        #[arg(long)]
        defaults: bool,
    },

    /// Validate a configuration file.
    Validate,

    /// Show per-table synchronization status.
    Status,

    /// Run one sync cycle now.
    Sync,

    /// List local changes waiting to be pushed.
    Queue {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Only show one severity: info, success, warning, error.
        #[arg(short, long)]
        severity: Option<String>,

        /// Collapse duplicate entries and retry forwarding before listing.
        #[arg(long)]
        dedup: bool,
    },

    /// Force a full resync of one table.
    Reset {
        /// Table name (e.g. books, fines).
        table: String,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check configuration, data directory and database health.
    Doctor,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = expand_tilde(&cli.config);
    match cli.command {
        Commands::Init { output, defaults } => commands::init::run_init(&output, defaults),
        Commands::Validate => commands::init::run_validate(&config_path),
        Commands::Doctor => commands::doctor::run_doctor(&config_path),
        command => {
            let config = load_config(&config_path)?;
            let db = Arc::new(open_database(&config)?);

            match command {
                Commands::Status => commands::status::run_status(&config, db),
                Commands::Queue { limit } => commands::status::run_queue(&db, limit),
                Commands::Sync => commands::sync::run_sync(config, db).await,
                Commands::Audit {
                    limit,
                    severity,
                    dedup,
                } => commands::audit::run_audit(config, db, limit, severity.as_deref(), dedup).await,
                Commands::Reset { table, yes } => {
                    commands::sync::run_reset(config, db, &table, yes).await
                }
                _ => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config
        .validate()
        .context("configuration validation failed")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    let db = Database::new(config.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

/// Build a sync engine talking to the configured remote. Fails when the API
/// key is not available.
fn connect_engine(config: AppConfig, db: Arc<Database>) -> Result<SyncEngine> {
    let remote: Arc<dyn RemoteClient> = Arc::new(
        RestRemote::new(&config.remote).context("failed to build remote client")?,
    );
    SyncEngine::new(config, db, remote).context("failed to initialize sync engine")
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
