//! On-demand sync cycle and full table reset.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::record::Table as MirrorTable;

use super::style;
use crate::connect_engine;

/// Run one full cycle against the remote and print per-table outcomes.
pub async fn run_sync(config: AppConfig, db: Arc<Database>) -> Result<()> {
    let engine = connect_engine(config, db)?;

    if !engine.check_connectivity().await {
        println!(
            "{}",
            style::warn("Remote is unreachable. Local changes stay queued until the next sync.")
        );
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .context("invalid spinner template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(format!("Syncing {} table(s)...", engine.tables().len()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = engine.run_cycle().await;
    spinner.finish_and_clear();
    let report = result.context("sync cycle failed")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Table", "State", "Pulled", "Applied", "Pushed", "Conflicts", "Rejected", "Deferred",
    ]);
    for o in &report.outcomes {
        table.add_row(vec![
            Cell::new(o.table),
            style::state_cell(o.state),
            Cell::new(o.pulled),
            Cell::new(o.applied),
            Cell::new(o.pushed),
            Cell::new(o.conflicts),
            Cell::new(o.rejected),
            Cell::new(o.deferred),
        ]);
    }
    println!("{}", table);

    let elapsed = report.completed_at - report.started_at;
    let failed = report.failed_tables();
    if failed.is_empty() {
        println!(
            "{}",
            style::success(&format!(
                "Sync cycle completed in {:.1}s",
                elapsed.num_milliseconds() as f64 / 1000.0
            ))
        );
    } else {
        for o in report.outcomes.iter().filter(|o| o.is_failed()) {
            println!(
                "{}",
                style::error(&format!(
                    "{}: {}",
                    o.table,
                    o.error.as_deref().unwrap_or("unknown error")
                ))
            );
        }
        anyhow::bail!("{} table(s) failed to sync", failed.len());
    }

    Ok(())
}

/// Rewind one table's cursor and purge its cached rows, keeping any row
/// that still has a queued local change.
pub async fn run_reset(config: AppConfig, db: Arc<Database>, table: &str, yes: bool) -> Result<()> {
    let table: MirrorTable = table.parse().context("unknown table")?;

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Purge cached '{table}' rows and resync them from the remote?"
            ))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !confirmed {
            println!("{}", style::warn("Reset cancelled."));
            return Ok(());
        }
    }

    let engine = connect_engine(config, db)?;
    let purged = engine
        .reset_table(table)
        .await
        .with_context(|| format!("failed to reset '{table}'"))?;

    println!(
        "{}",
        style::success(&format!(
            "{table}: cursor reset, {purged} cached row(s) purged. The next sync pulls the full table."
        ))
    );
    Ok(())
}
