//! Restore of the live database from a backup artifact
//!
//! The live file is copied into a safety folder before anything destructive
//! happens. After the swap the restored file must pass a quick check and a
//! foreign key check; if either fails, or the swap itself fails part way, the
//! safety copy is put back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::database::backup_naming::{has_backup_extension, safety_timestamp};
use crate::database::fsops::Filesystem;
use crate::database::jobs::{JobOutcome, JobPhase, JobReporter};
use crate::database::snapshot::SnapshotEngine;
use crate::database::verify::format_violations;
use crate::database::{BACKUP_EXTENSION, DatabaseError, Result};
use crate::db::ConnectionManager;

/// What has already happened to the live database
#[derive(Debug, Default)]
struct RestoreState {
    /// Folder holding the pre-restore copy, once taken
    safety_dir: Option<PathBuf>,
    /// Whether the live file may no longer hold its original content
    swapped: bool,
}

/// Restore of the live database from a `.imsdb` artifact
pub struct RestoreJob {
    config: Arc<EngineConfig>,
    fs: Arc<dyn Filesystem>,
    snapshot: Arc<dyn SnapshotEngine>,
    /// Coordinates the application's connections around the swap
    connections: Option<Arc<dyn ConnectionManager>>,
}

impl RestoreJob {
    pub fn new(
        config: Arc<EngineConfig>,
        fs: Arc<dyn Filesystem>,
        snapshot: Arc<dyn SnapshotEngine>,
        connections: Option<Arc<dyn ConnectionManager>>,
    ) -> Self {
        Self {
            config,
            fs,
            snapshot,
            connections,
        }
    }

    /// Run the restore from `artifact`, reporting through `reporter`
    pub async fn run(&self, artifact: &Path, reporter: &JobReporter) -> JobOutcome {
        let mut state = RestoreState::default();

        let err = match self.execute(artifact, reporter, &mut state).await {
            Ok(()) => {
                reporter.log("Restore completed successfully.");
                return reporter.succeed(
                    "Restore completed successfully.",
                    Some(artifact.to_path_buf()),
                );
            }
            Err(e) => e,
        };

        let mut message = format!("Restore failed.\n\n{}", err);
        match (&state.safety_dir, state.swapped) {
            (Some(safety_dir), true) => {
                reporter.enter(JobPhase::RollingBack);
                reporter.log("Attempting rollback from safety copy…");
                match self.rollback(safety_dir).await {
                    Ok(original) => {
                        reporter.log("Rollback succeeded.");
                        info!(from = %original.display(), "Restore rolled back");
                        message.push_str("\n\nRollback succeeded; the previous database is back in place.");
                    }
                    Err(rollback_err) => {
                        let line = rollback_err.to_string();
                        reporter.log(line.clone());
                        warn!(error = %rollback_err, "Rollback after failed restore also failed");
                        message.push_str(&format!(
                            "\n\n{}\nA copy of the previous database is kept in: {}",
                            line,
                            safety_dir.display()
                        ));
                    }
                }
            }
            (Some(safety_dir), false) => {
                reporter.log(format!(
                    "Live database was not modified; safety copy kept in: {}",
                    safety_dir.display()
                ));
            }
            (None, _) => {}
        }
        reporter.fail(message)
    }

    async fn execute(
        &self,
        artifact: &Path,
        reporter: &JobReporter,
        state: &mut RestoreState,
    ) -> Result<()> {
        reporter.enter(JobPhase::Validating);
        reporter.percent(5);
        if !artifact.is_file() {
            return Err(DatabaseError::Preflight(format!(
                "Backup file does not exist: {}",
                artifact.display()
            )));
        }
        if !has_backup_extension(artifact) {
            return Err(DatabaseError::Preflight(format!(
                "Backup file must have .{} extension.",
                BACKUP_EXTENSION
            )));
        }
        if !self.snapshot.quick_check(artifact).await {
            return Err(DatabaseError::VerificationFailed {
                check: "Backup integrity check",
                detail: String::from("PRAGMA quick_check != 'ok'"),
            });
        }
        let connections = self.connections.as_ref().ok_or_else(|| {
            DatabaseError::Preflight(String::from(
                "No database manager available to coordinate connections.",
            ))
        })?;
        let db_path = self.snapshot.database_path();

        reporter.enter(JobPhase::SafetyCopy);
        let timestamp = safety_timestamp(Local::now());
        let safety_dir = self.fs.safety_copy_current_db(&db_path, &timestamp).await?;
        reporter.log(format!("Safety copy created at: {}", safety_dir.display()));
        state.safety_dir = Some(safety_dir);
        reporter.percent(25);

        reporter.enter(JobPhase::Swapping);
        if let Err(e) = connections.close_all().await {
            // Some connections may already be gone; bring the pool back before failing
            if let Err(reopen) = connections.open().await {
                warn!(error = %reopen, "Could not reopen connections after a failed close");
            }
            return Err(e);
        }
        // Stale side files go before the rename, so a failed replace can still cost the live WAL
        state.swapped = true;
        self.fs
            .replace_db_with(artifact, &db_path)
            .await
            .map_err(|e| match e {
                DatabaseError::Locked(_) => e,
                other => DatabaseError::SwapFailed(other.to_string()),
            })?;
        connections.open().await?;
        reporter.percent(70);

        reporter.enter(JobPhase::PostCheck);
        if !self.snapshot.quick_check(&db_path).await {
            return Err(DatabaseError::VerificationFailed {
                check: "Restored database integrity check",
                detail: String::from("PRAGMA quick_check != 'ok'"),
            });
        }
        reporter.percent(85);

        reporter.enter(JobPhase::FkCheck);
        let violations = self.snapshot.foreign_key_check(&db_path).await?;
        if !violations.is_empty() {
            return Err(DatabaseError::VerificationFailed {
                check: "Foreign key check",
                detail: format!(
                    "{} violation(s) detected.\n{}",
                    violations.len(),
                    format_violations(&violations, self.config.fk_detail_limit)
                ),
            });
        }
        reporter.percent(100);
        Ok(())
    }

    /// Put the safety copy back over the live database
    async fn rollback(&self, safety_dir: &Path) -> Result<PathBuf> {
        let attempt = async {
            if let Some(connections) = &self.connections {
                connections.close_all().await?;
            }
            let db_path = self.snapshot.database_path();
            let db_name = db_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let original = self.fs.locate_original_db(safety_dir, &db_name).await?;
            self.fs.replace_db_with(&original, &db_path).await?;
            self.fs.restore_saved_wal(&original, &db_path).await?;
            if let Some(connections) = &self.connections {
                connections.open().await?;
            }
            Ok::<PathBuf, DatabaseError>(original)
        };
        attempt
            .await
            .map_err(|e| DatabaseError::RollbackFailed(e.to_string()))
    }
}
