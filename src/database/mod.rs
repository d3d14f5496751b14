//! Database module for SQLite snapshot, verification and restore operations

use std::path::PathBuf;

pub mod backup;
pub mod backup_naming;
pub mod fsops;
pub mod jobs;
pub mod restore;
pub mod service;
pub mod snapshot;
pub mod validators;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use backup::BackupJob;
pub use fsops::{Filesystem, LocalFilesystem};
pub use jobs::{JobCallbacks, JobHandle, JobKind, JobOutcome, JobPhase, NoopCallbacks, Progress};
pub use restore::RestoreJob;
pub use service::BackupService;
pub use snapshot::{SnapshotEngine, SnapshotOptions, SqliteSnapshotEngine};
pub use verify::{ForeignKeyViolation, VerificationResult, VerifyMode};

/// File extension (without the dot) every backup artifact carries
pub const BACKUP_EXTENSION: &str = "imsdb";

/// Companion files SQLite keeps next to a database in WAL mode
pub const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Rollback journal left behind by a non-WAL connection
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Database error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Folder is not writable: {path} ({reason})")]
    NotWritable { path: PathBuf, reason: String },

    #[error(
        "Not enough free space in destination folder.\nRequired (approx): {}, Available: {}.",
        validators::human_size(*required),
        validators::human_size(*available)
    )]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Database file not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Unable to remove database file (is it locked?): {0}")]
    Locked(PathBuf),

    #[error("{0}")]
    Preflight(String),

    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("Snapshot verification failed: {0}")]
    SnapshotVerificationFailed(String),

    #[error("{check} failed: {detail}")]
    VerificationFailed { check: &'static str, detail: String },

    #[error("Database swap failed: {0}")]
    SwapFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Job error: {0}")]
    Job(String),
}

impl DatabaseError {
    /// Errors raised before anything was written anywhere
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DatabaseError::NotWritable { .. }
                | DatabaseError::InsufficientSpace { .. }
                | DatabaseError::SourceMissing(_)
                | DatabaseError::Preflight(_)
                | DatabaseError::Config(_)
        )
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        DatabaseError::Sqlite(error.to_string())
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(error: rusqlite::Error) -> Self {
        DatabaseError::Sqlite(error.to_string())
    }
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;
