//! Sync status and pending-queue views.

use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::models::ChangeOp;
use shelfsync_core::sync_engine::collect_status;

use super::style;

/// Show per-table cursor, state and queue depth.
pub fn run_status(config: &AppConfig, db: Arc<Database>) -> Result<()> {
    let tables = config.sync.table_list().context("invalid table list")?;
    let status = collect_status(&db, &tables, false).context("failed to read sync status")?;

    println!();
    println!("{}", style::header("shelfsync Status"));
    println!();
    println!("  Remote          : {}", config.remote.url);
    println!("  Last cycle      : {}", style::when(status.last_cycle_at));
    println!("  Pending changes : {}", status.total_pending);
    println!(
        "  Audit events    : {} ({} errors, {} not forwarded)",
        status.audit_events, status.audit_errors, status.audit_unforwarded
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Table", "State", "Last sync", "Synced", "Pending", "Last error",
    ]);
    for t in &status.tables {
        table.add_row(vec![
            Cell::new(&t.table),
            style::state_cell(t.state),
            Cell::new(style::when(t.last_sync)),
            Cell::new(t.synced_records),
            Cell::new(t.pending_changes),
            Cell::new(style::truncate(t.last_error.as_deref().unwrap_or("—"), 60)),
        ]);
    }
    println!("{}", table);
    println!();

    Ok(())
}

/// List queued local mutations, oldest first.
pub fn run_queue(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_pending(limit)
        .context("failed to list pending changes")?;

    if entries.is_empty() {
        println!("{}", style::success("No pending local changes."));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Seq", "Table", "Record", "Op", "Snapshot", "Queued at"]);
    for entry in &entries {
        let op = match entry.op {
            ChangeOp::Create => Cell::new("create").fg(comfy_table::Color::Green),
            ChangeOp::Update => Cell::new("update").fg(comfy_table::Color::Yellow),
            ChangeOp::Delete => Cell::new("delete").fg(comfy_table::Color::Red),
        };
        table.add_row(vec![
            Cell::new(entry.seq),
            Cell::new(entry.table),
            Cell::new(&entry.record_id),
            op,
            Cell::new(style::when(Some(entry.snapshot_updated_at))),
            Cell::new(style::when(Some(entry.enqueued_at))),
        ]);
    }

    println!("{}", table);
    let total = db.count_pending(None).context("failed to count pending changes")?;
    println!(
        "{}",
        style::dim(&format!("{} of {} pending change(s) shown", entries.len(), total))
    );

    Ok(())
}
