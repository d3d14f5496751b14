//! Snapshot-and-swap backup and restore for a live SQLite database
//!
//! Backups are consistent copies of the live file written atomically as single
//! `.imsdb` artifacts. Restores take a safety copy first, swap the artifact in,
//! check it, and roll back when the checks fail.

pub mod config;
pub mod database;
pub mod db;
pub mod logging;

pub use config::EngineConfig;
pub use database::{
    BackupService, DatabaseError, JobCallbacks, JobHandle, JobOutcome, Progress, Result,
};
pub use db::{ConnectionManager, SqlitePoolManager};
