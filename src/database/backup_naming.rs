//! Naming rules for backup artifacts and pre-restore safety copies
//!
//! Artifacts get a human-friendly default name (`<App>_YYYY-MM-DD_HH-MM.imsdb`)
//! and always carry the fixed extension. Safety copies live in
//! `pre-restore-<YYYYmmdd-HHMMSS>` folders next to the live database, so they
//! sort by creation time.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::database::BACKUP_EXTENSION;

/// Prefix of every safety-copy folder
pub const SAFETY_DIR_PREFIX: &str = "pre-restore-";

/// Timestamp layout used in safety-copy folder names
const SAFETY_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Service for generating artifact names
#[derive(Debug, Clone)]
pub struct BackupNamingService {
    /// Application name used as the file name prefix
    app_name: String,
}

impl BackupNamingService {
    /// Create a naming service; an empty name falls back to `App`
    pub fn new(app_name: &str) -> Self {
        let app_name = app_name.trim();
        Self {
            app_name: if app_name.is_empty() {
                String::from("App")
            } else {
                app_name.to_string()
            },
        }
    }

    /// Suggested file name for a backup taken now
    pub fn default_backup_filename(&self) -> String {
        self.default_backup_filename_with_time(Local::now())
    }

    /// Suggested file name for a backup taken at `timestamp`
    pub fn default_backup_filename_with_time<Tz: TimeZone>(&self, timestamp: DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        format!(
            "{}_{}.{}",
            self.app_name,
            timestamp.format("%Y-%m-%d_%H-%M"),
            BACKUP_EXTENSION
        )
    }
}

/// Timestamp string used for a restore started at `now`
pub fn safety_timestamp<Tz: TimeZone>(now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(SAFETY_TIMESTAMP_FORMAT).to_string()
}

/// Folder name of the safety copy taken at `timestamp`
pub fn safety_dir_name(timestamp: &str) -> String {
    format!("{}{}", SAFETY_DIR_PREFIX, timestamp)
}

/// Short random alphanumeric suffix used to keep names unique
pub fn random_suffix() -> String {
    let mut rng = thread_rng();
    (0..6).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// Whether `path` ends in the backup extension (case-insensitive)
pub fn has_backup_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(BACKUP_EXTENSION))
        .unwrap_or(false)
}

/// `path` with its extension forced to the backup extension
pub fn with_backup_extension(path: &Path) -> PathBuf {
    if has_backup_extension(path) {
        path.to_path_buf()
    } else {
        path.with_extension(BACKUP_EXTENSION)
    }
}

/// Structured representation of a safety-copy folder name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyCopyId {
    /// Original folder name
    name: String,
    /// Local time the restore started
    timestamp: NaiveDateTime,
}

impl SafetyCopyId {
    /// Parse `pre-restore-YYYYmmdd-HHMMSS`, optionally followed by `-<suffix>`
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(SAFETY_DIR_PREFIX)?;
        // YYYYmmdd-HHMMSS is 15 characters
        let stamp = rest.get(..15)?;
        let tail = &rest[15..];
        if !(tail.is_empty() || tail.starts_with('-')) {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(stamp, SAFETY_TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            name: name.to_string(),
            timestamp,
        })
    }

    /// Get the folder name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the time the restore started
    pub fn timestamp(&self) -> &NaiveDateTime {
        &self.timestamp
    }
}

/// Safety copies next to `db_path`, newest first
pub fn list_safety_copies(db_path: &Path) -> std::io::Result<Vec<(SafetyCopyId, PathBuf)>> {
    let dir = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut copies = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let parsed = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(SafetyCopyId::parse);
        if let Some(id) = parsed {
            copies.push((id, path));
        }
    }
    copies.sort_by(|a, b| b.0.timestamp.cmp(&a.0.timestamp).then(b.0.name.cmp(&a.0.name)));
    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_default_backup_filename() {
        let service = BackupNamingService::new("Inventory");
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 59).unwrap();
        assert_eq!(
            service.default_backup_filename_with_time(timestamp),
            "Inventory_2025-06-01_14-30.imsdb"
        );

        let unnamed = BackupNamingService::new("  ");
        assert!(unnamed.default_backup_filename().starts_with("App_"));
    }

    #[test]
    fn test_safety_names() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        let ts = safety_timestamp(timestamp);
        assert_eq!(ts, "20250601-143000");
        assert_eq!(safety_dir_name(&ts), "pre-restore-20250601-143000");
        assert_eq!(random_suffix().len(), 6);
    }

    #[test]
    fn test_extension_enforcement() {
        assert!(has_backup_extension(Path::new("a/b.imsdb")));
        assert!(has_backup_extension(Path::new("a/b.IMSDB")));
        assert!(!has_backup_extension(Path::new("a/b.db")));
        assert_eq!(with_backup_extension(Path::new("a/b.db")), PathBuf::from("a/b.imsdb"));
        assert_eq!(with_backup_extension(Path::new("a/b")), PathBuf::from("a/b.imsdb"));
        assert_eq!(with_backup_extension(Path::new("a/b.IMSDB")), PathBuf::from("a/b.IMSDB"));
    }

    #[test]
    fn test_parse_safety_copy_id() {
        let parsed = SafetyCopyId::parse("pre-restore-20250601-143000").unwrap();
        assert_eq!(parsed.name(), "pre-restore-20250601-143000");
        assert_eq!(
            *parsed.timestamp(),
            NaiveDateTime::parse_from_str("2025-06-01 14:30:00", "%Y-%m-%d %H:%M:%S").unwrap()
        );

        assert!(SafetyCopyId::parse("pre-restore-20250601-143000-a1b2c3").is_some());
        assert!(SafetyCopyId::parse("pre-restore-20250601").is_none());
        assert!(SafetyCopyId::parse("backup-20250601-143000").is_none());
        assert!(SafetyCopyId::parse("pre-restore-20250601-143000x").is_none());
        assert!(SafetyCopyId::parse("pre-restore-20251301-143000").is_none());
    }

    #[test]
    fn test_list_safety_copies_newest_first() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("live.db");
        std::fs::write(&db, b"db").unwrap();
        for name in [
            "pre-restore-20250101-000000",
            "pre-restore-20250301-000000",
            "unrelated",
        ] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }

        let copies = list_safety_copies(&db).unwrap();
        let names: Vec<&str> = copies.iter().map(|(id, _)| id.name()).collect();
        assert_eq!(
            names,
            vec!["pre-restore-20250301-000000", "pre-restore-20250101-000000"]
        );
    }
}
