//! shelfsync core library.
//!
//! This crate provides the offline synchronization engine for the library
//! management data: configuration, the local SQLite mirror (store, sync
//! cursors, change queue, audit log), the remote client interface, conflict
//! resolution, and the per-table sync engine.

pub mod audit;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod models;
pub mod record;
pub mod remote;
pub mod retry;
pub mod sync_engine;

// Re-exports for convenience.
pub use audit::AuditLogger;
pub use config::AppConfig;
pub use db::Database;
pub use record::{Record, Table};
pub use remote::{InMemoryRemote, RemoteClient, RestRemote};
pub use sync_engine::{CycleReport, SyncEngine, TableOutcome};
