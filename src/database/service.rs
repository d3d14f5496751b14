//! Entry point for starting backup and restore jobs

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::database::backup::BackupJob;
use crate::database::backup_naming::BackupNamingService;
use crate::database::fsops::{Filesystem, LocalFilesystem};
use crate::database::jobs::{JobCallbacks, JobHandle, JobKind, JobReporter, JobRunner};
use crate::database::restore::RestoreJob;
use crate::database::snapshot::{SnapshotEngine, SqliteSnapshotEngine};
use crate::db::ConnectionManager;

/// Starts backup and restore jobs against one live database
///
/// Jobs run on a shared worker pool. A per-database mutex is held for the
/// whole of each job, so a backup never reads the file while a restore is
/// swapping it.
pub struct BackupService {
    config: Arc<EngineConfig>,
    fs: Arc<dyn Filesystem>,
    snapshot: Arc<dyn SnapshotEngine>,
    connections: Option<Arc<dyn ConnectionManager>>,
    runner: JobRunner,
    /// Serialises jobs on the live database
    db_lock: Arc<Mutex<()>>,
}

impl BackupService {
    /// Service using the local disk and SQLite snapshots, without a connection manager
    pub fn new(config: EngineConfig) -> Self {
        let snapshot = Arc::new(SqliteSnapshotEngine::new(&config));
        Self::with_components(config, Arc::new(LocalFilesystem::default()), snapshot, None)
    }

    pub fn with_components(
        config: EngineConfig,
        fs: Arc<dyn Filesystem>,
        snapshot: Arc<dyn SnapshotEngine>,
        connections: Option<Arc<dyn ConnectionManager>>,
    ) -> Self {
        let runner = JobRunner::new(config.max_concurrent_jobs);
        Self {
            config: Arc::new(config),
            fs,
            snapshot,
            connections,
            runner,
            db_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Attach the manager that closes and reopens the application's connections
    pub fn with_connection_manager(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Suggested artifact file name for a backup taken now
    pub fn default_backup_filename(&self) -> String {
        BackupNamingService::new(&self.config.app_name).default_backup_filename()
    }

    /// Start a backup of the live database into `dest_file`
    pub fn start_backup(
        &self,
        dest_file: impl Into<PathBuf>,
        callbacks: Arc<dyn JobCallbacks>,
    ) -> JobHandle {
        let dest_file = dest_file.into();
        let reporter = JobReporter::new(JobKind::Backup, callbacks);
        let job = BackupJob::new(self.config.clone(), self.fs.clone(), self.snapshot.clone());
        let db_lock = self.db_lock.clone();
        let job_reporter = reporter.clone();

        self.runner.spawn(reporter, async move {
            let _guard = db_lock.lock_owned().await;
            job.run(&dest_file, &job_reporter).await
        })
    }

    /// Start a restore of the live database from `artifact`
    pub fn start_restore(
        &self,
        artifact: impl Into<PathBuf>,
        callbacks: Arc<dyn JobCallbacks>,
    ) -> JobHandle {
        let artifact = artifact.into();
        let reporter = JobReporter::new(JobKind::Restore, callbacks);
        let job = RestoreJob::new(
            self.config.clone(),
            self.fs.clone(),
            self.snapshot.clone(),
            self.connections.clone(),
        );
        let db_lock = self.db_lock.clone();
        let job_reporter = reporter.clone();

        self.runner.spawn(reporter, async move {
            let _guard = db_lock.lock_owned().await;
            job.run(&artifact, &job_reporter).await
        })
    }
}
