//! Read-only integrity checks against a database file
//!
//! Every check opens its own read-only connection, so verifying a file never
//! writes to it and never leaves side files behind.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use tracing::debug;

use crate::database::fsops::with_name_suffix;
use crate::database::{DatabaseError, Result};

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Offset of the file format write version; 2 means write-ahead logging
const WRITE_VERSION_OFFSET: usize = 18;

/// Which structural check a snapshot is verified with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// `PRAGMA quick_check`
    Quick,
    /// `PRAGMA integrity_check`
    Full,
}

/// Outcome of a structural check: `ok` plus the first few diagnostic lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub ok: bool,
    pub details: Vec<String>,
}

impl VerificationResult {
    pub fn passed() -> Self {
        Self {
            ok: true,
            details: Vec::new(),
        }
    }

    pub fn failed(details: Vec<String>) -> Self {
        Self { ok: false, details }
    }

    /// Details joined on one line, for error messages
    pub fn excerpt(&self) -> String {
        if self.details.is_empty() {
            String::from("(no detail)")
        } else {
            self.details.join("; ")
        }
    }
}

/// One row of `PRAGMA foreign_key_check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyViolation {
    /// Table holding the offending row
    pub table: String,
    /// Rowid of the offending row (`None` for WITHOUT ROWID tables)
    pub rowid: Option<i64>,
    /// Table the missing parent row should be in
    pub parent: String,
    /// Index of the violated constraint in the table's foreign key list
    pub fkid: i64,
}

impl fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rowid = self
            .rowid
            .map(|r| r.to_string())
            .unwrap_or_else(|| String::from("None"));
        write!(
            f,
            "table={}, rowid={}, parent={}, fkid={}",
            self.table, rowid, self.parent, self.fkid
        )
    }
}

/// Bulleted listing of at most `limit` violations
pub fn format_violations(violations: &[ForeignKeyViolation], limit: usize) -> String {
    if violations.is_empty() {
        return String::from("(no detail rows)");
    }
    violations
        .iter()
        .take(limit)
        .map(|v| format!("- {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the header of the file at `path` marks it as a WAL database
fn header_is_wal(path: &Path) -> io::Result<bool> {
    let mut header = [0u8; 20];
    File::open(path)?.read_exact(&mut header)?;
    if &header[..16] != SQLITE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a SQLite database"));
    }
    Ok(header[WRITE_VERSION_OFFSET] == 2)
}

/// Connection options that can never create or modify anything
///
/// A WAL database without a `-wal` next to it has nothing to replay, so it is
/// opened immutable; a read-only connection would still create `-wal` and `-shm`.
pub fn read_only_options(path: &Path) -> SqliteConnectOptions {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false);
    let idle_wal = header_is_wal(path).unwrap_or(false) && !with_name_suffix(path, "-wal").exists();
    options.immutable(idle_wal)
}

async fn open_read_only(path: &Path) -> Result<SqliteConnection> {
    if !path.is_file() {
        return Err(DatabaseError::SourceMissing(path.to_path_buf()));
    }
    SqliteConnection::connect_with(&read_only_options(path))
        .await
        .map_err(|e| DatabaseError::Sqlite(format!("Failed to open {} read-only: {}", path.display(), e)))
}

/// `PRAGMA quick_check`; true only when the file opens and reports exactly `ok`
pub async fn quick_check(path: &Path) -> bool {
    let result: Result<Vec<String>> = async {
        let mut conn = open_read_only(path).await?;
        let rows = sqlx::query_scalar::<_, String>("PRAGMA quick_check")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        Ok(rows)
    }
    .await;

    match result {
        Ok(rows) => rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "quick_check could not run");
            false
        }
    }
}

/// `PRAGMA integrity_check`, keeping at most `limit_errors` error lines
pub async fn integrity_check(path: &Path, limit_errors: usize) -> VerificationResult {
    let limit = limit_errors.max(1);
    let result: Result<Vec<String>> = async {
        let mut conn = open_read_only(path).await?;
        let rows = sqlx::query_scalar::<_, String>(&format!("PRAGMA integrity_check({})", limit))
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        Ok(rows)
    }
    .await;

    match result {
        Ok(rows) if rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok") => {
            VerificationResult::passed()
        }
        Ok(rows) if rows.is_empty() => {
            VerificationResult::failed(vec![String::from("integrity_check returned no rows")])
        }
        Ok(rows) => VerificationResult::failed(rows.into_iter().take(limit).collect()),
        Err(e) => VerificationResult::failed(vec![format!("exception: {}", e)]),
    }
}

/// `PRAGMA foreign_key_check`; an empty list means referentially clean
pub async fn foreign_key_check(path: &Path) -> Result<Vec<ForeignKeyViolation>> {
    let mut conn = open_read_only(path).await?;
    let rows = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut conn)
        .await?;

    let mut violations = Vec::with_capacity(rows.len());
    for row in rows {
        violations.push(ForeignKeyViolation {
            table: row.try_get(0)?,
            rowid: row.try_get(1)?,
            parent: row.try_get(2)?,
            fkid: row.try_get(3)?,
        });
    }
    conn.close().await?;
    Ok(violations)
}

/// Whether the database at `path` is in write-ahead-log journal mode
///
/// Read from the file header, so the file is never opened by SQLite.
pub async fn is_wal_mode(path: &Path) -> Result<bool> {
    if !path.is_file() {
        return Err(DatabaseError::SourceMissing(path.to_path_buf()));
    }
    header_is_wal(path)
        .map_err(|e| DatabaseError::Sqlite(format!("Cannot read header of {}: {}", path.display(), e)))
}

/// Run `mode` and, when asked, the foreign key check; fail with a short excerpt
pub async fn verify_file(
    path: &Path,
    mode: Option<VerifyMode>,
    fk_check: bool,
    limit_errors: usize,
) -> Result<()> {
    match mode {
        None => {}
        Some(VerifyMode::Quick) => {
            if !quick_check(path).await {
                return Err(DatabaseError::SnapshotVerificationFailed(String::from(
                    "PRAGMA quick_check != 'ok'",
                )));
            }
        }
        Some(VerifyMode::Full) => {
            let result = integrity_check(path, limit_errors).await;
            if !result.ok {
                return Err(DatabaseError::SnapshotVerificationFailed(format!(
                    "PRAGMA integrity_check: {}",
                    result.excerpt()
                )));
            }
        }
    }

    if fk_check {
        let violations = foreign_key_check(path).await?;
        if !violations.is_empty() {
            return Err(DatabaseError::SnapshotVerificationFailed(format!(
                "{} foreign key violation(s)\n{}",
                violations.len(),
                format_violations(&violations, limit_errors.max(1))
            )));
        }
    }
    Ok(())
}
