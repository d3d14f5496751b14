use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;

use imsdb_vault::database::backup_naming::{SafetyCopyId, list_safety_copies};
use imsdb_vault::database::verify::{self, ForeignKeyViolation, VerificationResult};
use imsdb_vault::{
    BackupService, ConnectionManager, DatabaseError, EngineConfig, JobCallbacks, JobHandle,
    JobOutcome, Progress, SqlitePoolManager, logging,
};

#[derive(Parser, Debug)]
#[command(name = "imsdb-vault", version)]
#[command(about = "Consistent backups and safe restores of a live SQLite database")]
struct Cli {
    /// Live database file (overrides APP_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Append JSON-lines operation events to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a backup artifact of the live database
    Backup {
        /// Destination file (default: <App>_<date>_<time>.imsdb in the current folder)
        dest: Option<PathBuf>,
    },
    /// Replace the live database with a backup artifact
    Restore {
        /// Backup artifact to restore from
        artifact: PathBuf,
    },
    /// List pre-restore safety copies next to the live database, newest first
    SafetyCopies,
    /// Run read-only checks against a database file
    Check {
        /// Database or artifact to check
        file: PathBuf,
        /// Run the full integrity check instead of the quick check
        #[arg(long)]
        full: bool,
        /// Also run the foreign key check
        #[arg(long)]
        fk: bool,
    },
}

/// Prints job events to stderr
struct ConsoleCallbacks;

impl JobCallbacks for ConsoleCallbacks {
    fn phase(&self, phase: &str) {
        eprintln!("==> {}", phase);
    }

    fn progress(&self, progress: Progress) {
        if let Progress::Percent(pct) = progress {
            eprintln!("    {:>3}%", pct);
        }
    }

    fn log(&self, line: &str) {
        eprintln!("    {}", line);
    }
}

#[derive(Serialize)]
struct CheckReport {
    path: PathBuf,
    mode: &'static str,
    result: VerificationResult,
    wal_mode: Option<bool>,
    foreign_key_violations: Option<Vec<ForeignKeyViolation>>,
}

async fn run_check(file: &Path, full: bool, fk: bool, limit: usize) -> Result<CheckReport, DatabaseError> {
    if !file.is_file() {
        return Err(DatabaseError::SourceMissing(file.to_path_buf()));
    }
    let result = if full {
        verify::integrity_check(file, limit).await
    } else if verify::quick_check(file).await {
        VerificationResult::passed()
    } else {
        VerificationResult::failed(vec![String::from("PRAGMA quick_check != 'ok'")])
    };
    let foreign_key_violations = if fk {
        Some(verify::foreign_key_check(file).await?)
    } else {
        None
    };
    Ok(CheckReport {
        path: file.to_path_buf(),
        mode: if full { "integrity_check" } else { "quick_check" },
        result,
        wal_mode: verify::is_wal_mode(file).await.ok(),
        foreign_key_violations,
    })
}

#[derive(Serialize)]
struct SafetyCopyEntry {
    #[serde(flatten)]
    id: SafetyCopyId,
    path: PathBuf,
}

fn safety_copies_command(db: Option<PathBuf>) -> ExitCode {
    let config = match EngineConfig::from_env_with(db, &[]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    match list_safety_copies(&config.db_path) {
        Ok(copies) => {
            let entries: Vec<SafetyCopyEntry> = copies
                .into_iter()
                .map(|(id, path)| SafetyCopyEntry { id, path })
                .collect();
            print_json(&entries);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", DatabaseError::from(e));
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn exit_code(outcome: &JobOutcome) -> ExitCode {
    if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn check_command(file: &Path, full: bool, fk: bool) -> ExitCode {
    let config = EngineConfig::new(file.to_path_buf());
    if let Err(e) = logging::init(&config) {
        eprintln!("Logging disabled: {}", e);
    }
    match run_check(file, full, fk, config.integrity_error_limit).await {
        Ok(report) => {
            let clean = report.result.ok
                && report
                    .foreign_key_violations
                    .as_ref()
                    .is_none_or(|v| v.is_empty());
            print_json(&report);
            if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_service(
    db: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> Result<(BackupService, Arc<SqlitePoolManager>), DatabaseError> {
    let mut config = EngineConfig::from_env_with(db, &[])?;
    if log_file.is_some() {
        config.log_file = log_file;
    }
    if let Err(e) = logging::init(&config) {
        eprintln!("Logging disabled: {}", e);
    }
    let manager = Arc::new(SqlitePoolManager::new(&config.db_path));
    let service = BackupService::new(config).with_connection_manager(manager.clone());
    Ok((service, manager))
}

/// Run one job to completion, print its outcome as JSON
async fn run_job<F>(db: Option<PathBuf>, log_file: Option<PathBuf>, start: F) -> ExitCode
where
    F: FnOnce(&BackupService) -> JobHandle,
{
    let (service, manager) = match build_service(db, log_file) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = start(&service).wait().await;

    if let Err(e) = manager.close_all().await {
        eprintln!("Failed to close database connections: {}", e);
    }
    print_json(&outcome);
    exit_code(&outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file, full, fk } => check_command(&file, full, fk).await,
        Commands::SafetyCopies => safety_copies_command(cli.db),
        Commands::Backup { dest } => {
            run_job(cli.db, cli.log_file, |service| {
                let dest = dest.unwrap_or_else(|| PathBuf::from(service.default_backup_filename()));
                service.start_backup(dest, Arc::new(ConsoleCallbacks))
            })
            .await
        }
        Commands::Restore { artifact } => {
            run_job(cli.db, cli.log_file, |service| {
                service.start_restore(artifact, Arc::new(ConsoleCallbacks))
            })
            .await
        }
    }
}
