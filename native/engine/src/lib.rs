//! Backup and restore engine for Android app packages and their data directories.
//!
//! Everything that touches another app's files goes through [`shell::PrivilegedExecutor`],
//! either directly or via a [`transport::ShellTransport`]. Backups are written per app into
//! timestamped instances under the configured [`location::BackupLocation`].

pub mod action;
pub mod archive;
pub mod batch;
pub mod config;
pub mod error;
pub mod fs;
pub mod location;
pub mod logging;
pub mod models;
pub mod ownership;
pub mod package;
pub mod shell;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use action::{BackupOrchestrator, Mode, RestoreOrchestrator};
pub use batch::{BatchReport, BatchRunner};
pub use config::EngineConfig;
pub use error::{ActionError, FailedStep};
