//! Config generation and validation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::Style;
use dialoguer::{Confirm, Input, Select};

use shelfsync_core::config::AppConfig;
use shelfsync_core::record::Table;

use super::style;

/// Values collected by the init wizard.
struct InitSettings {
    remote_url: String,
    api_key_env: String,
    data_dir: PathBuf,
    poll_interval_secs: u64,
    push_mode: &'static str,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            remote_url: "https://your-project.supabase.co".into(),
            api_key_env: "SHELFSYNC_API_KEY".into(),
            data_dir: default_data_dir(),
            poll_interval_secs: 60,
            push_mode: "coalesced",
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("shelfsync"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/shelfsync"))
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

/// Write a config file to `output`, prompting for the main settings unless
/// `defaults` is set.
pub fn run_init(output: &Path, defaults: bool) -> Result<()> {
    if output.exists() {
        if defaults {
            anyhow::bail!(
                "file already exists: {}. Use a different path or remove the existing file.",
                output.display()
            );
        }
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !overwrite {
            println!(
                "{}",
                style::warn("Init cancelled. Existing file was not modified.")
            );
            return Ok(());
        }
    }

    let settings = if defaults {
        InitSettings::default()
    } else {
        match prompt_settings()? {
            Some(settings) => settings,
            None => {
                println!("{}", style::warn("Init cancelled. No file was written."));
                return Ok(());
            }
        }
    };

    std::fs::write(output, render_config(&settings)).context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Export the API key: export {}=<anon or service key>", settings.api_key_env);
    println!("  2. Validate with: shelfsync validate --config {}", output.display());
    println!("  3. Start the daemon: shelfsync-daemon --config {}", output.display());
    Ok(())
}

fn prompt_settings() -> Result<Option<InitSettings>> {
    let accent = Style::new().cyan().bold();
    let defaults = InitSettings::default();
    println!();
    println!("{}", accent.apply_to("=== shelfsync setup ==="));
    println!();

    let remote_url: String = Input::new()
        .with_prompt("Remote API URL")
        .validate_with(|input: &String| -> Result<(), String> {
            if input.starts_with("http://") || input.starts_with("https://") {
                Ok(())
            } else {
                Err("Must start with http:// or https://".into())
            }
        })
        .interact_text()
        .context("failed to read remote URL")?;

    let api_key_env: String = Input::new()
        .with_prompt("Environment variable that holds the API key")
        .default(defaults.api_key_env.clone())
        .interact_text()
        .context("failed to read API key env var name")?;

    let data_dir: String = Input::new()
        .with_prompt("Data directory")
        .default(defaults.data_dir.display().to_string())
        .interact_text()
        .context("failed to read data directory")?;

    let poll_options = ["30 seconds", "1 minute", "5 minutes", "15 minutes"];
    let poll_values = [30, 60, 300, 900];
    let poll_choice = Select::new()
        .with_prompt("How often should the daemon sync?")
        .items(&poll_options)
        .default(1)
        .interact()
        .context("failed to read poll interval")?;

    let push_options = [
        "coalesced (send each record's final state)",
        "ordered (send every change in sequence)",
    ];
    let push_choice = Select::new()
        .with_prompt("How should queued local changes be pushed?")
        .items(&push_options)
        .default(0)
        .interact()
        .context("failed to read push mode")?;

    let settings = InitSettings {
        remote_url,
        api_key_env,
        data_dir: PathBuf::from(data_dir),
        poll_interval_secs: poll_values[poll_choice],
        push_mode: if push_choice == 0 { "coalesced" } else { "ordered" },
    };

    println!();
    println!("{}", style::header("Summary"));
    println!("    Remote URL     : {}", settings.remote_url);
    println!("    API key env    : {}", settings.api_key_env);
    println!("    Data dir       : {}", settings.data_dir.display());
    println!("    Poll interval  : {}s", settings.poll_interval_secs);
    println!("    Push mode      : {}", settings.push_mode);
    println!();

    let confirmed = Confirm::new()
        .with_prompt("Write this configuration?")
        .default(true)
        .interact()
        .context("failed to read confirmation")?;
    Ok(confirmed.then_some(settings))
}

fn render_config(s: &InitSettings) -> String {
    let tables = Table::ALL
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r##"# shelfsync configuration
# Generated by `shelfsync init`

[daemon]
# How often (in seconds) to run a sync cycle.
poll_interval_secs = {poll}
# Minimum log level: trace, debug, info, warn, error.
log_level = "info"
# Local SQLite mirror lives here.
data_dir = "{data_dir}"

[remote]
url = "{url}"
# Name of the environment variable holding the API key. The key itself is
# never written to this file.
api_key_env = "{key_env}"
request_timeout_secs = 30
connect_timeout_secs = 10

[sync]
tables = [{tables}]
page_size = 1000
max_attempts = 5
backoff_base_ms = 500
backoff_max_ms = 30000
max_concurrent_tables = 4
# coalesced | ordered
push_mode = "{push_mode}"

[audit]
# Collapse duplicate audit entries every N cycles.
dedup_every_cycles = 10
forward_to_remote = true
"##,
        poll = s.poll_interval_secs,
        data_dir = s.data_dir.display().to_string().replace('\\', "\\\\"),
        url = s.remote_url,
        key_env = s.api_key_env,
        tables = tables,
        push_mode = s.push_mode,
    )
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

pub fn run_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    let _ = config.resolve_env_vars();
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));

    println!();
    println!("Configuration summary:");
    println!("  Remote URL    : {}", config.remote.url);
    println!(
        "  API key       : {}",
        if config.remote.api_key.is_some() {
            "set".to_string()
        } else {
            format!("NOT SET (export {})", config.remote.api_key_env)
        }
    );
    println!("  Tables        : {}", config.sync.tables.join(", "));
    println!("  Push mode     : {}", config.sync.push_mode);
    println!("  Page size     : {}", config.sync.page_size);
    println!(
        "  Retries       : {} attempts, {}-{}ms backoff",
        config.sync.max_attempts, config.sync.backoff_base_ms, config.sync.backoff_max_ms
    );
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}
