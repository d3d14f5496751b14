//! Background job model shared by backup and restore
//!
//! A job runs on the [`JobRunner`] worker pool and reports through a
//! [`JobReporter`], which records phase, progress and a rolling log, mirrors
//! everything into tracing and forwards it to the caller's [`JobCallbacks`].

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::logging;

/// Lines kept in a job's rolling log
const MAX_LOG_LINES: usize = 500;

/// Progress reported to callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// Work is happening but its length is unknown
    Indeterminate,
    /// Percentage in `0..=100`
    Percent(u8),
}

impl Progress {
    pub fn percent(value: u8) -> Self {
        Progress::Percent(value.min(100))
    }
}

/// Receiver of job events; every method defaults to doing nothing
///
/// Methods are called from worker threads. A panicking callback is logged and
/// otherwise ignored.
pub trait JobCallbacks: Send + Sync {
    fn phase(&self, _phase: &str) {}

    fn progress(&self, _progress: Progress) {}

    fn log(&self, _line: &str) {}

    /// Called exactly once per job
    fn finished(&self, _success: bool, _message: &str, _path: Option<&Path>) {}
}

/// Callbacks that ignore every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl JobCallbacks for NoopCallbacks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }

    /// Headline of a failure message
    pub fn failure_headline(&self) -> &'static str {
        match self {
            JobKind::Backup => "Backup failed.",
            JobKind::Restore => "Restore failed.",
        }
    }
}

/// Steps of the backup and restore state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Preflight,
    Snapshotting,
    Verifying,
    Saving,
    Validating,
    SafetyCopy,
    Swapping,
    PostCheck,
    FkCheck,
    RollingBack,
    Done,
    Failed,
}

impl JobPhase {
    /// Text shown to the user when the phase starts
    pub fn label(&self) -> &'static str {
        match self {
            JobPhase::Pending => "Waiting",
            JobPhase::Preflight => "Preflight",
            JobPhase::Snapshotting => "Snapshotting database",
            JobPhase::Verifying => "Verifying backup image",
            JobPhase::Saving => "Saving",
            JobPhase::Validating => "Validating backup",
            JobPhase::SafetyCopy => "Creating safety copy",
            JobPhase::Swapping => "Swapping database files",
            JobPhase::PostCheck => "Post-restore checks",
            JobPhase::FkCheck => "Checking foreign keys",
            JobPhase::RollingBack => "Rolling back",
            JobPhase::Done => "Done",
            JobPhase::Failed => "Finished with errors",
        }
    }
}

/// Terminal result of a job, also delivered through [`JobCallbacks::finished`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub success: bool,
    /// Human-readable summary; multi-line on failure
    pub message: String,
    /// Artifact written by a backup, or artifact restored from
    pub path: Option<PathBuf>,
    /// Last phase entered before the job ended
    pub last_phase: JobPhase,
    /// Rolling job log, oldest first
    pub log: Vec<String>,
}

struct JobState {
    phase: JobPhase,
    progress: Progress,
    log: VecDeque<String>,
    outcome: Option<JobOutcome>,
}

struct ReporterInner {
    kind: JobKind,
    callbacks: Arc<dyn JobCallbacks>,
    state: Mutex<JobState>,
}

/// Records job state and fans events out to callbacks and tracing
#[derive(Clone)]
pub struct JobReporter {
    inner: Arc<ReporterInner>,
}

impl JobReporter {
    pub fn new(kind: JobKind, callbacks: Arc<dyn JobCallbacks>) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                kind,
                callbacks,
                state: Mutex::new(JobState {
                    phase: JobPhase::Pending,
                    progress: Progress::Indeterminate,
                    log: VecDeque::new(),
                    outcome: None,
                }),
            }),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        // A poisoned lock only means a panic elsewhere; the state is still usable
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, f: impl FnOnce(&dyn JobCallbacks)) {
        let callbacks = self.inner.callbacks.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(callbacks))).is_err() {
            debug!(op = self.inner.kind.as_str(), "Job callback panicked; ignored");
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.state().phase
    }

    pub fn current_progress(&self) -> Progress {
        self.state().progress
    }

    /// Move to `phase` and announce it
    pub fn enter(&self, phase: JobPhase) {
        self.state().phase = phase;
        logging::log_event(self.inner.kind.as_str(), phase.label(), "phase started");
        self.notify(|cb| cb.phase(phase.label()));
    }

    pub fn progress(&self, progress: Progress) {
        self.state().progress = progress;
        self.notify(|cb| cb.progress(progress));
    }

    pub fn percent(&self, value: u8) {
        self.progress(Progress::percent(value));
    }

    /// Append a line to the job log
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        let phase = {
            let mut state = self.state();
            if state.log.len() == MAX_LOG_LINES {
                state.log.pop_front();
            }
            state.log.push_back(line.clone());
            state.phase
        };
        logging::log_event(self.inner.kind.as_str(), phase.label(), &line);
        self.notify(|cb| cb.log(&line));
    }

    /// Snapshot of the job log
    pub fn log_lines(&self) -> Vec<String> {
        self.state().log.iter().cloned().collect()
    }

    /// Finish successfully
    pub fn succeed(&self, message: &str, path: Option<PathBuf>) -> JobOutcome {
        self.finish(true, message.to_string(), path)
    }

    /// Finish with a failure message
    pub fn fail(&self, message: String) -> JobOutcome {
        self.finish(false, message, None)
    }

    /// Record the terminal outcome and fire `finished`; later calls return the first outcome
    fn finish(&self, success: bool, message: String, path: Option<PathBuf>) -> JobOutcome {
        let outcome = {
            let mut state = self.state();
            if let Some(existing) = &state.outcome {
                return existing.clone();
            }
            let last_phase = state.phase;
            state.phase = if success { JobPhase::Done } else { JobPhase::Failed };
            let outcome = JobOutcome {
                kind: self.inner.kind,
                success,
                message,
                path,
                last_phase,
                log: state.log.iter().cloned().collect(),
            };
            state.outcome = Some(outcome.clone());
            outcome
        };

        let terminal = if success { JobPhase::Done } else { JobPhase::Failed };
        if success {
            info!(op = self.inner.kind.as_str(), path = ?outcome.path, "{}", outcome.message);
        } else {
            error!(op = self.inner.kind.as_str(), phase = outcome.last_phase.label(), "{}", outcome.message);
        }
        logging::log_event(self.inner.kind.as_str(), terminal.label(), &outcome.message);
        self.notify(|cb| cb.phase(terminal.label()));
        self.notify(|cb| cb.finished(outcome.success, &outcome.message, outcome.path.as_deref()));
        outcome
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.state().outcome.clone()
    }
}

/// Awaitable handle to a job running on the pool
pub struct JobHandle {
    reporter: JobReporter,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn kind(&self) -> JobKind {
        self.reporter.kind()
    }

    pub fn phase(&self) -> JobPhase {
        self.reporter.phase()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> JobOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => self.reporter.fail(format!(
                "{}\n\nJob task did not complete: {}",
                self.reporter.kind().failure_headline(),
                e
            )),
        }
    }
}

/// Worker pool running jobs on the tokio runtime
#[derive(Clone)]
pub struct JobRunner {
    /// Bounds how many jobs run at once
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    /// Permits not currently held by a running job
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `work` in the background; `work` must finish through `reporter`
    ///
    /// A panic inside `work` becomes a failed outcome, so `finished` fires
    /// exactly once either way.
    pub fn spawn<F>(&self, reporter: JobReporter, work: F) -> JobHandle
    where
        F: Future<Output = JobOutcome> + Send + 'static,
    {
        let permits = self.permits.clone();
        let job_reporter = reporter.clone();
        let task = tokio::spawn(async move {
            // The semaphore is never closed, so acquiring only fails if it were
            let _permit = permits.acquire_owned().await.ok();
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| String::from("unknown panic"));
                    job_reporter.fail(format!(
                        "{}\n\nInternal error: {}",
                        job_reporter.kind().failure_headline(),
                        reason
                    ))
                }
            }
        });
        JobHandle { reporter, task }
    }
}
