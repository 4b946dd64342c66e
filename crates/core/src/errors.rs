//! Error types for the shelfsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. Conflicts are deliberately absent: a conflict is a value
//! handed to the resolver, never a failure.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite-backed Local Store.
///
/// Any storage error is fatal for the batch being written; callers retry the
/// whole batch.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying rusqlite error.
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database was busy or locked by another writer.
    #[error("storage transaction conflict: {0}")]
    TransactionConflict(String),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A stored row or queued payload could not be mapped back to an entity.
    #[error("stored data is malformed: {0}")]
    Malformed(#[from] RecordError),

    /// Generic I/O error (e.g. file permissions).
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Classify a rusqlite error, separating lock contention from hard failures.
    pub fn classify(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::TransactionConflict(err.to_string())
            }
            other => Self::Sqlite(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

/// Errors from the remote backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote is unreachable or answered with a retryable status.
    #[error("remote unavailable: {0}")]
    Transient(String),

    /// A network call exceeded its deadline. Treated like [`Self::Transient`].
    #[error("remote call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The remote refused a write because it holds a newer version.
    #[error("remote rejected stale write to {table}/{id}")]
    Rejected {
        table: String,
        id: String,
        /// The remote's current version of the record, when it still exists.
        current: Option<serde_json::Value>,
    },

    /// The remote returned a non-retryable error status.
    #[error("remote API error (HTTP {status}): {body}")]
    Api {
        status: u16,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("remote response decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            match err.status() {
                Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                    Self::Transient(err.to_string())
                }
                Some(status) => Self::Api {
                    status: status.as_u16(),
                    body: err.to_string(),
                },
                None => Self::Transient(err.to_string()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record classification errors
// ---------------------------------------------------------------------------

/// Raised when a loose JSON shape cannot be mapped to a closed entity variant.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The table name is not one of the mirrored tables.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// The payload is not a JSON object.
    #[error("{table} payload is not an object")]
    NotAnObject {
        table: String,
    },

    /// The payload does not deserialize into the table's entity.
    #[error("invalid {table} record: {detail}")]
    InvalidShape {
        table: String,
        detail: String,
    },

    /// The payload deserialized but breaks an entity invariant.
    #[error("{table} record {id} violates invariant: {detail}")]
    InvariantViolation {
        table: String,
        id: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the synchronizer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync cycle is already running.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning {
        started_at: String,
    },

    /// The cycle was cancelled at a checkpoint.
    #[error("sync of '{table}' cancelled")]
    Cancelled {
        table: String,
    },

    /// A transient remote failure persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: RemoteError,
    },

    /// Non-retryable remote failure.
    #[error("sync remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local store failure.
    #[error("sync storage error: {0}")]
    Storage(#[from] StorageError),

    /// A background task panicked or was aborted.
    #[error("sync task for '{table}' aborted: {detail}")]
    TaskAborted {
        table: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
