use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::{DatabaseError, Result};

/// Environment variable naming the live database file
pub const DB_PATH_ENV: &str = "APP_DB_PATH";

/// Host-provided lookup of the live database path, consulted in order
pub type DbPathAccessor = Box<dyn Fn() -> Option<PathBuf> + Send + Sync>;

/// Configuration for the backup and restore engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute path of the live database file
    pub db_path: PathBuf,
    /// Free space required at the destination, as a multiple of the live size
    pub space_factor: f64,
    /// Error lines kept by `PRAGMA integrity_check`
    pub integrity_error_limit: usize,
    /// Foreign key violations listed in a restore failure
    pub fk_detail_limit: usize,
    /// Pages copied per online backup step
    pub copy_pages_per_step: i32,
    /// Sleep between online backup steps
    pub copy_pause: Duration,
    /// Jobs allowed to run at the same time
    pub max_concurrent_jobs: usize,
    /// JSON-lines operations log, if any
    pub log_file: Option<PathBuf>,
    /// Prefix of default artifact names
    pub app_name: String,
}

impl EngineConfig {
    /// Defaults for the database at `db_path`
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            space_factor: 1.5,
            integrity_error_limit: 3,
            fk_detail_limit: 10,
            copy_pages_per_step: 1024,
            copy_pause: Duration::from_millis(10),
            max_concurrent_jobs: 2,
            log_file: None,
            app_name: String::from("App"),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(None, &[])
    }

    /// Load configuration from environment variables, resolving the database
    /// path from `explicit`, then `APP_DB_PATH`, then `accessors`
    pub fn from_env_with(explicit: Option<PathBuf>, accessors: &[DbPathAccessor]) -> Result<Self> {
        let db_path = resolve_db_path(explicit, env::var(DB_PATH_ENV).ok(), accessors)?;
        let mut config = Self::new(db_path);

        if let Some(jobs) = parse_var::<usize>("BACKUP_MAX_JOBS") {
            config.max_concurrent_jobs = jobs.max(1);
        }
        if let Some(pages) = parse_var::<i32>("BACKUP_COPY_PAGES") {
            config.copy_pages_per_step = pages.max(1);
        }
        if let Some(ms) = parse_var::<u64>("BACKUP_COPY_SLEEP_MS") {
            config.copy_pause = Duration::from_millis(ms);
        }
        config.log_file = env::var("BACKUP_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| expand_home(v.trim()));
        if let Ok(name) = env::var("BACKUP_APP_NAME") {
            if !name.trim().is_empty() {
                config.app_name = name.trim().to_string();
            }
        }

        Ok(config)
    }

    /// Default location of the operations log, next to the working directory
    pub fn default_log_file() -> PathBuf {
        PathBuf::from("logs").join("backup_restore.log")
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) {
            let rest = raw.trim_start_matches('~').trim_start_matches('/');
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path)
        .map_err(|e| DatabaseError::Config(format!("Cannot resolve {}: {}", path.display(), e)))
}

/// Resolve the live database path: explicit value, then the environment
/// value, then each host accessor in order
pub fn resolve_db_path(
    explicit: Option<PathBuf>,
    env_value: Option<String>,
    accessors: &[DbPathAccessor],
) -> Result<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return absolutize(path);
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return absolutize(expand_home(value.trim()));
    }
    for accessor in accessors {
        if let Some(path) = accessor().filter(|p| !p.as_os_str().is_empty()) {
            return absolutize(path);
        }
    }
    Err(DatabaseError::Config(format!(
        "Could not determine the live database path; set {} or pass it explicitly",
        DB_PATH_ENV
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let accessors: Vec<DbPathAccessor> = vec![Box::new(|| Some(PathBuf::from("/host/app.db")))];
        let resolved = resolve_db_path(
            Some(PathBuf::from("/explicit/app.db")),
            Some(String::from("/env/app.db")),
            &accessors,
        )
        .unwrap();
        assert_eq!(resolved, PathBuf::from("/explicit/app.db"));
    }

    #[test]
    fn test_env_then_accessors() {
        let accessors: Vec<DbPathAccessor> = vec![
            Box::new(|| None),
            Box::new(|| Some(PathBuf::from("/host/app.db"))),
        ];
        let from_env =
            resolve_db_path(None, Some(String::from("/env/app.db")), &accessors).unwrap();
        assert_eq!(from_env, PathBuf::from("/env/app.db"));

        let from_host = resolve_db_path(None, Some(String::from("  ")), &accessors).unwrap();
        assert_eq!(from_host, PathBuf::from("/host/app.db"));
    }

    #[test]
    fn test_relative_paths_are_absolutized() {
        let resolved = resolve_db_path(Some(PathBuf::from("data/app.db")), None, &[]).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("data/app.db"));
    }

    #[test]
    fn test_unresolvable_path_is_a_config_error() {
        let accessors: Vec<DbPathAccessor> = vec![Box::new(|| None)];
        let err = resolve_db_path(None, None, &accessors).unwrap_err();
        assert!(matches!(err, DatabaseError::Config(_)));
        assert!(err.to_string().contains(DB_PATH_ENV));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/data/app.db");
        assert_eq!(config.space_factor, 1.5);
        assert_eq!(config.fk_detail_limit, 10);
        assert!(config.log_file.is_none());
        assert_eq!(
            EngineConfig::default_log_file(),
            PathBuf::from("logs/backup_restore.log")
        );
    }
}
