//! TOML-based configuration system for shelfsync.
//!
//! The remote API key is never stored in the file. The `remote.api_key_env`
//! field names the environment variable that holds it, and the key is
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::record::Table;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Remote backend connection settings.
    pub remote: RemoteConfig,

    /// Sync behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sync cycles (default 60).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the local database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shelfsync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Connection settings for the PostgREST backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Project base URL (e.g. `https://abc.supabase.co`).
    pub url: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Resolved API key (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_api_key_env() -> String {
    "SHELFSYNC_API_KEY".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// How queued local mutations are transmitted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Fold every record's queued mutations into its final state.
    #[default]
    Coalesced,
    /// Push every queued mutation individually, in sequence order.
    Ordered,
}

impl std::fmt::Display for PushMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coalesced => write!(f, "coalesced"),
            Self::Ordered => write!(f, "ordered"),
        }
    }
}

/// Sync behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Mirrored tables to synchronize.
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,

    /// Rows fetched per pull page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Attempts per network call before the table is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles on every further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Tables synchronized concurrently.
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,

    #[serde(default)]
    pub push_mode: PushMode,
}

fn default_tables() -> Vec<String> {
    Table::ALL.iter().map(|t| t.as_str().to_string()).collect()
}
fn default_page_size() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_max_concurrent_tables() -> usize {
    4
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables: default_tables(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_concurrent_tables: default_max_concurrent_tables(),
            push_mode: PushMode::default(),
        }
    }
}

impl SyncConfig {
    /// Parse the configured table names, in dependency order.
    pub fn table_list(&self) -> Result<Vec<Table>, ConfigError> {
        let mut tables = self
            .tables
            .iter()
            .map(|name| {
                name.parse::<Table>().map_err(|_| ConfigError::InvalidValue {
                    field: "sync.tables".into(),
                    detail: format!("unknown table '{name}'"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        tables.sort();
        tables.dedup();
        Ok(tables)
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Run audit maintenance (dedup, forwarding retry) every N sync cycles.
    #[serde(default = "default_dedup_every")]
    pub dedup_every_cycles: u64,

    /// Forward events to the remote `log_system_event` sink.
    #[serde(default = "default_true")]
    pub forward_to_remote: bool,
}

fn default_dedup_every() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dedup_every_cycles: default_dedup_every(),
            forward_to_remote: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the API key from its environment variable.
    ///
    /// A missing variable logs a warning but does **not** fail; the remote
    /// client refuses to start without a key, while offline-only commands
    /// keep working.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        self.remote.api_key = resolve_optional_env(&self.remote.api_key_env, "remote.api_key_env");
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "remote.url".into(),
                detail: "remote URL must not be empty".into(),
            });
        }
        if !self.remote.url.starts_with("http://") && !self.remote.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "remote.url".into(),
                detail: "remote URL must start with http:// or https://".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "remote.request_timeout_secs".into(),
                detail: "request timeout must be > 0".into(),
            });
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.page_size".into(),
                detail: "page size must be > 0".into(),
            });
        }
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.sync.max_concurrent_tables == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_concurrent_tables".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.sync.backoff_max_ms < self.sync.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                field: "sync.backoff_max_ms".into(),
                detail: "maximum backoff is below the base delay".into(),
            });
        }
        if self.sync.table_list()?.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.tables".into(),
                detail: "at least one table must be synchronized".into(),
            });
        }

        Ok(())
    }

    /// Path of the local SQLite database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("shelfsync.db")
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
