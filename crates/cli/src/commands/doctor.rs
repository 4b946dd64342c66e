//! Health check for a local installation.

use std::path::Path;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use shelfsync_core::config::AppConfig;
use shelfsync_core::db::Database;
use shelfsync_core::record::Table as MirrorTable;

use super::style;

/// Check config, data directory and database, then list every mirrored table
/// with its row count and queue depth.
pub fn run_doctor(config_path: &Path) -> Result<()> {
    println!();
    println!("{}", style::header("shelfsync Doctor"));
    println!("{}", "═".repeat(16));
    println!();

    let mut issues = Vec::new();

    // 1. Configuration
    let config = match AppConfig::load_from_file(config_path) {
        Ok(mut config) => {
            let _ = config.resolve_env_vars();
            match config.validate() {
                Ok(()) => println!("  {}", style::success("Configuration     Valid")),
                Err(e) => {
                    println!("  {}", style::error(&format!("Configuration     {}", e)));
                    issues.push("Fix configuration errors".to_string());
                }
            }
            if config.remote.api_key.is_some() {
                println!("  {}", style::success("API key           Set"));
            } else {
                println!("  {}", style::warn("API key           Not set (offline only)"));
                issues.push(format!("Export {} to enable sync", config.remote.api_key_env));
            }
            config
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Configuration     {}", e)));
            issues.push(format!(
                "Create a config with: shelfsync init --output {}",
                config_path.display()
            ));
            print_summary(&issues);
            return Ok(());
        }
    };

    // 2. Data directory
    let data_dir = &config.daemon.data_dir;
    if data_dir.exists() {
        println!(
            "  {}",
            style::success(&format!("Data Directory    {}", data_dir.display()))
        );
    } else {
        println!(
            "  {}",
            style::error(&format!("Data Directory    {} (missing)", data_dir.display()))
        );
        issues.push(format!("Create data directory: mkdir -p {}", data_dir.display()));
    }

    // 3. Database
    let db_path = config.database_path();
    if !db_path.exists() {
        println!("  {}", style::warn("Database          Not initialized"));
        issues.push("Run 'shelfsync sync' or start the daemon to initialize".to_string());
        print_summary(&issues);
        return Ok(());
    }
    let db = match Database::new(&db_path).and_then(|db| db.initialize().map(|()| db)) {
        Ok(db) => {
            println!("  {}", style::success("Database          OK"));
            db
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Database          {}", e)));
            issues.push("Database is unreadable. Move it aside and resync.".to_string());
            print_summary(&issues);
            return Ok(());
        }
    };

    // 4. Tables
    println!();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Table", "Rows", "Pending", "Last sync"]);
    for mirror in MirrorTable::ALL {
        let rows = db.count_records(mirror);
        let pending = db.count_pending(Some(mirror));
        let cursor = db.get_cursor(mirror);
        match (rows, pending, cursor) {
            (Ok(rows), Ok(pending), Ok(cursor)) => {
                let pending_cell = if pending > 0 {
                    Cell::new(pending).fg(comfy_table::Color::Yellow)
                } else {
                    Cell::new(pending)
                };
                table.add_row(vec![
                    Cell::new(mirror),
                    Cell::new(rows),
                    pending_cell,
                    Cell::new(style::when(cursor.last_sync)),
                ]);
            }
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                table.add_row(vec![
                    Cell::new(mirror),
                    Cell::new(format!("error: {e}")).fg(comfy_table::Color::Red),
                    Cell::new("—"),
                    Cell::new("—"),
                ]);
                issues.push(format!("Table '{mirror}' is not readable"));
            }
        }
    }
    println!("{}", table);

    print_summary(&issues);
    Ok(())
}

fn print_summary(issues: &[String]) {
    println!();
    if issues.is_empty() {
        println!("  {} All checks passed!", console::style("✓").green().bold());
    } else {
        println!(
            "  {} {} issue(s) found:",
            console::style("!").yellow().bold(),
            issues.len()
        );
        for (i, issue) in issues.iter().enumerate() {
            println!("    {}. {}", i + 1, issue);
        }
    }
    println!();
}
