//! Subcommand implementations.

pub mod audit;
pub mod doctor;
pub mod init;
pub mod status;
pub mod style;
pub mod sync;
