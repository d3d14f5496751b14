//! Tracing setup and the append-only operations log

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EngineConfig;
use crate::database::{DatabaseError, Result};

/// Target used for operation events, so they can be filtered separately
pub const OPS_TARGET: &str = "imsdb_vault::ops";

/// Install the global subscriber: stderr output plus, when configured, a
/// JSON-lines file. Returns `false` if a subscriber was already installed.
pub fn init(config: &EngineConfig) -> Result<bool> {
    let env_filter = EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| DatabaseError::Config(format!("Cannot open log file {}: {}", path.display(), e)))?;
            Some(fmt::layer().json().with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Emit one operations-log event
pub fn log_event(op: &str, phase: &str, message: &str) {
    info!(target: OPS_TARGET, op, phase, "{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_log_file_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let log_file = dir.path().join("logs").join("backup_restore.log");
        let mut config = EngineConfig::new(dir.path().join("app.db"));
        config.log_file = Some(log_file.clone());

        let first = init(&config).unwrap();
        log_event("backup", "Preflight", "phase started");
        assert!(log_file.exists());

        assert!(first);

        // A second install is refused without error
        assert!(!init(&config).unwrap());

        let contents = std::fs::read_to_string(&log_file).unwrap();
        let line = contents.lines().last().unwrap();
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["fields"]["op"], "backup");
        assert_eq!(event["fields"]["phase"], "Preflight");
    }
}
