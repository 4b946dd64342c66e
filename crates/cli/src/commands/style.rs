//! Shared styling utilities for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color};
use console::Style;

use shelfsync_core::models::{Severity, TableState};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Table cell for a per-table sync state.
pub fn state_cell(state: TableState) -> Cell {
    match state {
        TableState::Idle => Cell::new("● idle").fg(Color::Green),
        TableState::Failed => Cell::new("✗ failed").fg(Color::Red),
        other => Cell::new(format!("⧗ {other}")).fg(Color::Yellow),
    }
}

/// Table cell for an audit severity.
pub fn severity_cell(severity: Severity) -> Cell {
    let color = match severity {
        Severity::Info => Color::Reset,
        Severity::Success => Color::Green,
        Severity::Warning => Color::Yellow,
        Severity::Error => Color::Red,
    };
    Cell::new(severity).fg(color)
}

/// Short local-agnostic rendering of a timestamp, or "never".
pub fn when(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Truncate to `max_len` characters, marking the cut with "...".
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
