//! Audit log listing and maintenance.

use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use shelfsync_core::audit::AuditLogger;
use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::models::Severity;

use super::style;
use crate::connect_engine;

/// Show recent audit entries, newest first.
pub async fn run_audit(
    config: AppConfig,
    db: Arc<Database>,
    limit: u32,
    severity: Option<&str>,
    dedup: bool,
) -> Result<()> {
    let severity = match severity {
        Some(s) => Some(parse_severity(s)?),
        None => None,
    };

    if dedup {
        // Without an API key only the local collapse can run.
        let report = match connect_engine(config, db.clone()) {
            Ok(engine) => engine.run_audit_maintenance().await?,
            Err(e) => {
                println!("{}", style::warn(&format!("{e:#}; running local maintenance only")));
                AuditLogger::local_only(db.clone()).run_maintenance().await?
            }
        };
        println!(
            "{}",
            style::success(&format!(
                "Collapsed {} duplicate(s), forwarded {} event(s){}",
                report.collapsed,
                report.forwarded,
                if report.remote_cleaned { ", remote log cleaned" } else { "" }
            ))
        );
        println!();
    }

    let entries = db
        .list_audit(limit, severity)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Severity", "Component", "Action", "Description", "×"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(style::when(Some(entry.last_seen_at))),
            style::severity_cell(entry.event.severity),
            Cell::new(&entry.event.component),
            Cell::new(&entry.event.action),
            Cell::new(style::truncate(&entry.event.description, 70)),
            Cell::new(entry.repeat_count),
        ]);
    }
    println!("{}", table);
    println!("{}", style::dim(&format!("{} entries shown", entries.len())));

    Ok(())
}

fn parse_severity(s: &str) -> Result<Severity> {
    match s {
        "info" | "success" | "warning" | "error" => Ok(Severity::from_str_val(s)),
        other => anyhow::bail!(
            "invalid severity '{}': use info, success, warning or error",
            other
        ),
    }
}
