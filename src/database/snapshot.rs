//! Consistent snapshots of the live SQLite database
//!
//! Two strategies produce a standalone copy of the live file:
//! the SQLite Online Backup API, which copies page by page while the
//! application keeps using the database, and `VACUUM INTO`, a compacting
//! export that needs a brief exclusive lock. The online copy is tried first;
//! the export only runs when the online copy failed before writing anything.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::OpenFlags;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{Connection, Executor};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::database::fsops::{self, with_name_suffix};
use crate::database::validators;
use crate::database::verify::{self, ForeignKeyViolation, VerificationResult, VerifyMode};
use crate::database::{DatabaseError, Result, JOURNAL_SUFFIX, SIDE_FILE_SUFFIXES};

/// Receives snapshot progress as a percentage, always below 100
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Highest progress a copy reports; the rest is left for verification
pub const COPY_PROGRESS_CEILING: u8 = 95;

/// How a freshly written snapshot is checked before it is handed back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Structural check to run on the snapshot, if any
    pub verify: Option<VerifyMode>,
    /// Also run the foreign key check
    pub fk_check: bool,
}

/// Percentage of pages copied, capped at [`COPY_PROGRESS_CEILING`]
pub fn copy_progress(total_pages: i64, remaining_pages: i64) -> u8 {
    if total_pages <= 0 {
        return 0;
    }
    let done = (total_pages - remaining_pages).clamp(0, total_pages);
    let pct = done * 100 / total_pages;
    pct.min(COPY_PROGRESS_CEILING as i64) as u8
}

/// One way of copying a database file into a new standalone file
#[async_trait]
pub trait SnapshotStrategy: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &'static str;

    /// Copy `source` into `dest`; `dest` is absent or an empty file
    async fn copy(&self, source: &Path, dest: &Path, progress: Option<ProgressFn>) -> Result<()>;
}

/// Page-by-page copy through the SQLite Online Backup API
#[derive(Debug, Clone)]
pub struct OnlineCopy {
    /// Number of pages to copy in each step
    pages_per_step: i32,
    /// Sleep between steps so writers are not starved
    pause: Duration,
    /// Consecutive busy/locked steps tolerated before giving up
    max_busy_steps: u32,
}

impl Default for OnlineCopy {
    fn default() -> Self {
        Self {
            pages_per_step: 1024,
            pause: Duration::from_millis(10),
            max_busy_steps: 100,
        }
    }
}

impl OnlineCopy {
    pub fn new(pages_per_step: i32, pause: Duration) -> Self {
        Self {
            pages_per_step: pages_per_step.max(1),
            pause,
            ..Self::default()
        }
    }
}

fn run_online_copy(
    source: &Path,
    dest: &Path,
    pages_per_step: i32,
    pause: Duration,
    max_busy_steps: u32,
    progress: Option<ProgressFn>,
) -> Result<()> {
    let src = rusqlite::Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut dst = rusqlite::Connection::open(dest)?;
    let backup = Backup::new(&src, &mut dst)?;

    let mut busy_steps = 0;
    loop {
        match backup.step(pages_per_step)? {
            StepResult::Done => break,
            StepResult::More => busy_steps = 0,
            _ => {
                busy_steps += 1;
                if busy_steps > max_busy_steps {
                    return Err(DatabaseError::SnapshotFailed(String::from(
                        "source database stayed busy during online copy",
                    )));
                }
            }
        }
        if let Some(report) = &progress {
            let p = backup.progress();
            report(copy_progress(p.pagecount as i64, p.remaining as i64));
        }
        std::thread::sleep(pause);
    }
    Ok(())
}

#[async_trait]
impl SnapshotStrategy for OnlineCopy {
    fn name(&self) -> &'static str {
        "online copy"
    }

    async fn copy(&self, source: &Path, dest: &Path, progress: Option<ProgressFn>) -> Result<()> {
        let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
        let (pages, pause, max_busy) = (self.pages_per_step, self.pause, self.max_busy_steps);
        tokio::task::spawn_blocking(move || {
            run_online_copy(&source, &dest, pages, pause, max_busy, progress)
        })
        .await
        .map_err(|e| DatabaseError::Job(format!("online copy task did not complete: {}", e)))?
    }
}

/// Whole-database rewrite with `VACUUM INTO`
#[derive(Debug, Clone, Default)]
pub struct CompactingExport;

#[async_trait]
impl SnapshotStrategy for CompactingExport {
    fn name(&self) -> &'static str {
        "compacting export"
    }

    async fn copy(&self, source: &Path, dest: &Path, _progress: Option<ProgressFn>) -> Result<()> {
        let dest_path = dest
            .to_str()
            .ok_or_else(|| DatabaseError::Sqlite("Invalid snapshot path".to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(source)
            .create_if_missing(false);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| DatabaseError::Sqlite(format!("Failed to open live database: {}", e)))?;

        // Fold committed WAL frames into the main file first
        conn.execute("PRAGMA wal_checkpoint(PASSIVE)")
            .await
            .map_err(|e| DatabaseError::Sqlite(format!("Failed to checkpoint: {}", e)))?;

        let vacuum_sql = format!("VACUUM INTO '{}'", dest_path.replace('\'', "''"));
        conn.execute(vacuum_sql.as_str())
            .await
            .map_err(|e| DatabaseError::Sqlite(format!("Failed to execute VACUUM INTO: {}", e)))?;

        conn.close().await?;
        Ok(())
    }
}

/// Switch a freshly written snapshot to rollback-journal mode so it never needs side files
async fn normalize_journal_mode(dest: &Path) -> Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(dest)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Delete);
    let conn = SqliteConnection::connect_with(&options)
        .await
        .map_err(|e| DatabaseError::Sqlite(format!("Failed to open snapshot: {}", e)))?;
    conn.close().await?;
    Ok(())
}

fn discard_partial(dest: &Path) {
    for suffix in SIDE_FILE_SUFFIXES.iter().chain(std::iter::once(&JOURNAL_SUFFIX)) {
        let _ = std::fs::remove_file(with_name_suffix(dest, suffix));
    }
    let _ = std::fs::remove_file(dest);
}

/// Produces and verifies copies of the live database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Absolute path of the live database file
    fn database_path(&self) -> PathBuf;

    /// Write a standalone, optionally verified, copy of the live database to `dest`
    async fn create_consistent_snapshot(
        &self,
        dest: &Path,
        progress: Option<ProgressFn>,
        options: SnapshotOptions,
    ) -> Result<()>;

    async fn quick_check(&self, path: &Path) -> bool;

    async fn integrity_check(&self, path: &Path, limit_errors: usize) -> VerificationResult;

    async fn foreign_key_check(&self, path: &Path) -> Result<Vec<ForeignKeyViolation>>;

    async fn is_wal_mode(&self, path: &Path) -> Result<bool>;
}

/// [`SnapshotEngine`] for a SQLite database on local disk
pub struct SqliteSnapshotEngine {
    /// Live database file
    db_path: PathBuf,
    /// Strategy tried first
    primary: Arc<dyn SnapshotStrategy>,
    /// Strategy used when the primary fails before writing
    fallback: Arc<dyn SnapshotStrategy>,
    /// Error lines kept by verification
    limit_errors: usize,
}

impl SqliteSnapshotEngine {
    /// Engine using the online copy with the compacting export as fallback
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_strategies(
            config.db_path.clone(),
            Arc::new(OnlineCopy::new(config.copy_pages_per_step, config.copy_pause)),
            Arc::new(CompactingExport),
        )
        .with_error_limit(config.integrity_error_limit)
    }

    pub fn with_strategies(
        db_path: PathBuf,
        primary: Arc<dyn SnapshotStrategy>,
        fallback: Arc<dyn SnapshotStrategy>,
    ) -> Self {
        Self {
            db_path,
            primary,
            fallback,
            limit_errors: 3,
        }
    }

    pub fn with_error_limit(mut self, limit_errors: usize) -> Self {
        self.limit_errors = limit_errors.max(1);
        self
    }

    async fn copy_with_fallback(&self, dest: &Path, progress: Option<ProgressFn>) -> Result<()> {
        let primary_err = match self.primary.copy(&self.db_path, dest, progress.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if fsops::db_size_bytes(dest) > 0 {
            discard_partial(dest);
            return Err(DatabaseError::SnapshotFailed(format!(
                "{} failed after writing: {}",
                self.primary.name(),
                primary_err
            )));
        }

        warn!(
            strategy = self.primary.name(),
            fallback = self.fallback.name(),
            error = %primary_err,
            "Snapshot strategy failed before writing, falling back"
        );
        discard_partial(dest);

        if let Err(fallback_err) = self.fallback.copy(&self.db_path, dest, progress).await {
            discard_partial(dest);
            return Err(DatabaseError::SnapshotFailed(format!(
                "{}: {}; {}: {}",
                self.primary.name(),
                primary_err,
                self.fallback.name(),
                fallback_err
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotEngine for SqliteSnapshotEngine {
    fn database_path(&self) -> PathBuf {
        self.db_path.clone()
    }

    async fn create_consistent_snapshot(
        &self,
        dest: &Path,
        progress: Option<ProgressFn>,
        options: SnapshotOptions,
    ) -> Result<()> {
        validators::validate_backup_source(&self.db_path)?;
        let start_time = Instant::now();
        debug!(source = %self.db_path.display(), dest = %dest.display(), "Starting snapshot");

        self.copy_with_fallback(dest, progress.clone()).await?;
        normalize_journal_mode(dest).await?;
        if let Some(report) = &progress {
            report(COPY_PROGRESS_CEILING);
        }

        verify::verify_file(dest, options.verify, options.fk_check, self.limit_errors).await?;

        info!(
            dest = %dest.display(),
            size_bytes = fsops::db_size_bytes(dest),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Snapshot created"
        );
        Ok(())
    }

    async fn quick_check(&self, path: &Path) -> bool {
        verify::quick_check(path).await
    }

    async fn integrity_check(&self, path: &Path, limit_errors: usize) -> VerificationResult {
        verify::integrity_check(path, limit_errors).await
    }

    async fn foreign_key_check(&self, path: &Path) -> Result<Vec<ForeignKeyViolation>> {
        verify::foreign_key_check(path).await
    }

    async fn is_wal_mode(&self, path: &Path) -> Result<bool> {
        verify::is_wal_mode(path).await
    }
}
