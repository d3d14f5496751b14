//! Preflight checks with user-facing error messages
//!
//! These run before any byte is written so a failure here never leaves
//! anything behind on disk.

use std::path::{Path, PathBuf};

use crate::database::{DatabaseError, Result};

const RESERVED_WINDOWS_NAMES: [&str; 4] = ["con", "prn", "aux", "nul"];

/// Format a byte count the way messages shown to users do (`"10.0 MB"`)
pub fn human_size(num_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = num_bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

/// Space a backup of `db_size` bytes needs in its destination volume
pub fn required_space(db_size: u64, factor: f64) -> u64 {
    (db_size as f64 * factor).ceil() as u64
}

/// Fail with `InsufficientSpace` when `free_space` is below `factor × db_size`
pub fn check_free_space(db_size: u64, free_space: u64, factor: f64) -> Result<()> {
    let required = required_space(db_size, factor);
    if free_space < required {
        return Err(DatabaseError::InsufficientSpace {
            required,
            available: free_space,
        });
    }
    Ok(())
}

/// Parent folder a destination file will be written into
pub fn destination_parent(dest_file: &Path) -> PathBuf {
    match dest_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_reserved_windows_name(stem: &str) -> bool {
    let stem = stem.trim_end_matches('.').to_ascii_lowercase();
    if RESERVED_WINDOWS_NAMES.contains(&stem.as_str()) {
        return true;
    }
    ["com", "lpt"].iter().any(|prefix| {
        stem.strip_prefix(prefix)
            .map(|digit| digit.len() == 1 && matches!(digit.as_bytes()[0], b'1'..=b'9'))
            .unwrap_or(false)
    })
}

/// Validate that `dest_file` can receive a backup of `db_size` bytes
///
/// Checks, in order: parent folder exists and is a folder, the file name is
/// usable on this platform, the destination is not a directory, and the
/// volume has `space_factor × db_size` bytes free.
pub fn validate_backup_destination(
    dest_file: &Path,
    db_size: u64,
    free_space: u64,
    space_factor: f64,
) -> Result<()> {
    let parent = destination_parent(dest_file);
    if !parent.exists() {
        return Err(DatabaseError::Preflight(format!(
            "Destination folder does not exist: {}",
            parent.display()
        )));
    }
    if !parent.is_dir() {
        return Err(DatabaseError::Preflight(format!(
            "Destination path is not a folder: {}",
            parent.display()
        )));
    }

    let name = dest_file
        .file_name()
        .map(|n| n.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(DatabaseError::Preflight(
            "Please provide a file name for the backup.".to_string(),
        ));
    }

    if cfg!(windows) {
        let stem = dest_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if is_reserved_windows_name(&stem) {
            return Err(DatabaseError::Preflight(format!(
                "The backup filename '{}' is reserved on Windows.",
                stem
            )));
        }
        if name.ends_with(' ') || name.ends_with('.') {
            return Err(DatabaseError::Preflight(
                "Windows filenames cannot end with a space or dot.".to_string(),
            ));
        }
    }

    if dest_file.is_dir() {
        return Err(DatabaseError::Preflight(
            "Destination path refers to a directory, not a file.".to_string(),
        ));
    }

    check_free_space(db_size, free_space, space_factor)
}

/// Validate that the live database exists, is a regular file and is not empty
pub fn validate_backup_source(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        return Err(DatabaseError::SourceMissing(db_path.to_path_buf()));
    }
    let metadata = std::fs::metadata(db_path)?;
    if !metadata.is_file() {
        return Err(DatabaseError::Preflight(format!(
            "Database path is not a file: {}",
            db_path.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(DatabaseError::Preflight(
            "The database file appears to be empty (0 bytes). \
             Please verify the active database location."
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0.0 B");
        assert_eq!(human_size(1023), "1023.0 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(human_size(3 * 1024_u64.pow(4)), "3.0 TB");
        assert_eq!(human_size(2048 * 1024_u64.pow(4)), "2048.0 TB");
    }

    #[test]
    fn test_space_rule_uses_factor() {
        let mb = 1024 * 1024;
        assert!(check_free_space(10 * mb, 15 * mb, 1.5).is_ok());
        let err = check_free_space(10 * mb, 5 * mb, 1.5).unwrap_err();
        match err {
            DatabaseError::InsufficientSpace { required, available } => {
                assert_eq!(required, 15 * mb);
                assert_eq!(available, 5 * mb);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_destination_checks() {
        let dir = tempdir().unwrap();

        let missing = dir.path().join("nope").join("backup.imsdb");
        let err = validate_backup_destination(&missing, 10, 1_000, 1.5).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let err = validate_backup_destination(dir.path(), 10, 1_000, 1.5).unwrap_err();
        assert!(err.to_string().contains("directory"));

        let ok = dir.path().join("backup.imsdb");
        validate_backup_destination(&ok, 10, 1_000, 1.5).unwrap();

        let err = validate_backup_destination(&ok, 1_000, 10, 1.5).unwrap_err();
        assert!(matches!(err, DatabaseError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_reserved_windows_names() {
        assert!(is_reserved_windows_name("CON"));
        assert!(is_reserved_windows_name("com1"));
        assert!(is_reserved_windows_name("lpt9."));
        assert!(!is_reserved_windows_name("com10"));
        assert!(!is_reserved_windows_name("backup"));
    }

    #[test]
    fn test_source_checks() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("live.db");

        assert!(matches!(
            validate_backup_source(&db),
            Err(DatabaseError::SourceMissing(_))
        ));

        std::fs::write(&db, b"").unwrap();
        assert!(validate_backup_source(&db).unwrap_err().to_string().contains("empty"));

        std::fs::write(&db, b"not really sqlite").unwrap();
        validate_backup_source(&db).unwrap();
    }

    #[test]
    fn test_destination_parent_defaults_to_cwd() {
        assert_eq!(destination_parent(Path::new("backup.imsdb")), PathBuf::from("."));
        assert_eq!(
            destination_parent(Path::new("/srv/backups/a.imsdb")),
            PathBuf::from("/srv/backups")
        );
    }
}
