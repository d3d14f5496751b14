//! SQLite database backup job
//!
//! Takes a consistent snapshot of the live database into a temp file next to
//! the destination, verifies it, then moves it into place in one atomic step.
//! The destination path only ever holds nothing, its previous content, or a
//! complete verified artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::database::backup_naming::with_backup_extension;
use crate::database::fsops::Filesystem;
use crate::database::jobs::{JobOutcome, JobPhase, JobReporter, Progress};
use crate::database::snapshot::{COPY_PROGRESS_CEILING, ProgressFn, SnapshotEngine, SnapshotOptions};
use crate::database::validators::{destination_parent, validate_backup_destination};
use crate::database::{BACKUP_EXTENSION, DatabaseError, Result};

/// Progress reported once the snapshot passed its check
const VERIFIED_PROGRESS: u8 = 97;

/// Backup of the live database into a single `.imsdb` file
pub struct BackupJob {
    config: Arc<EngineConfig>,
    /// Filesystem used for temp files and the final move
    fs: Arc<dyn Filesystem>,
    /// Source of snapshots and integrity checks
    snapshot: Arc<dyn SnapshotEngine>,
}

impl BackupJob {
    /// Create a new backup job
    pub fn new(
        config: Arc<EngineConfig>,
        fs: Arc<dyn Filesystem>,
        snapshot: Arc<dyn SnapshotEngine>,
    ) -> Self {
        Self {
            config,
            fs,
            snapshot,
        }
    }

    /// Run the backup to `dest_file`, reporting through `reporter`
    ///
    /// Never returns an error: every failure becomes a failed [`JobOutcome`].
    pub async fn run(&self, dest_file: &Path, reporter: &JobReporter) -> JobOutcome {
        let start_time = Instant::now();
        let mut temp_file: Option<PathBuf> = None;

        match self.execute(dest_file, reporter, &mut temp_file).await {
            Ok(saved) => {
                info!(
                    dest = %saved.display(),
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Backup completed"
                );
                reporter.succeed("Backup completed successfully.", Some(saved))
            }
            Err(e) if e.is_preflight() && temp_file.is_none() => {
                info!(error = %e, "Backup rejected before anything was written");
                reporter.fail(format!("Backup failed.\n\n{}", e))
            }
            Err(e) => {
                if let Some(temp) = temp_file {
                    if let Err(cleanup) = self.fs.remove_file(&temp).await {
                        debug!(path = %temp.display(), error = %cleanup, "Could not remove temp snapshot");
                    }
                }
                reporter.fail(format!("Backup failed.\n\n{}", e))
            }
        }
    }

    /// Size of the live database, which must exist and be non-empty
    async fn live_size(&self, db_path: &Path) -> Result<u64> {
        match self.fs.file_size(db_path).await {
            Ok(0) => Err(DatabaseError::Preflight(String::from(
                "The database file appears to be empty (0 bytes). \
                 Please verify the active database location.",
            ))),
            Ok(size) => Ok(size),
            Err(DatabaseError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DatabaseError::SourceMissing(db_path.to_path_buf()))
            }
            Err(e) => Err(e),
        }
    }

    /// Everything that must hold before a single byte is written
    async fn preflight(&self, dest_file: &Path, reporter: &JobReporter) -> Result<PathBuf> {
        reporter.enter(JobPhase::Preflight);
        reporter.progress(Progress::Indeterminate);

        let db_path = self.snapshot.database_path();
        let db_size = self.live_size(&db_path).await?;
        let dest_parent = destination_parent(dest_file);
        let free_bytes = self.fs.free_space_bytes(&dest_parent).await?;
        debug!(
            db = %db_path.display(),
            db_size,
            free_bytes,
            dest = %dest_parent.display(),
            "Backup preflight"
        );

        validate_backup_destination(dest_file, db_size, free_bytes, self.config.space_factor)?;
        self.fs.ensure_writable_dir(&dest_parent).await?;

        match self.snapshot.is_wal_mode(&db_path).await {
            Ok(true) => reporter.log("Live database uses write-ahead logging; copying online."),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Could not read journal mode"),
        }
        Ok(dest_parent)
    }

    async fn execute(
        &self,
        dest_file: &Path,
        reporter: &JobReporter,
        temp_file: &mut Option<PathBuf>,
    ) -> Result<PathBuf> {
        let dest_parent = self.preflight(dest_file, reporter).await?;

        reporter.enter(JobPhase::Snapshotting);
        reporter.log(format!("Reading from: {}", self.snapshot.database_path().display()));
        let suffix = format!(".{}", BACKUP_EXTENSION);
        let temp = self.fs.make_temp_file(&dest_parent, &suffix).await?;
        *temp_file = Some(temp.clone());

        let step_reporter = reporter.clone();
        let progress: ProgressFn =
            Arc::new(move |pct| step_reporter.percent(pct.min(COPY_PROGRESS_CEILING)));
        self.snapshot
            .create_consistent_snapshot(&temp, Some(progress), SnapshotOptions::default())
            .await?;

        reporter.enter(JobPhase::Verifying);
        if !self.snapshot.quick_check(&temp).await {
            return Err(DatabaseError::VerificationFailed {
                check: "Snapshot integrity check",
                detail: String::from("PRAGMA quick_check != 'ok'"),
            });
        }
        reporter.percent(VERIFIED_PROGRESS);

        reporter.enter(JobPhase::Saving);
        let final_path = with_backup_extension(dest_file);
        self.fs.atomic_move(&temp, &final_path).await?;
        *temp_file = None;
        reporter.percent(100);
        reporter.log(format!("Backup written to: {}", final_path.display()));

        Ok(final_path)
    }
}
