//! Filesystem primitives for moving database files around safely
//!
//! Every operation that makes new content visible follows the same order:
//! write into a sibling temp file, `fsync` it, rename it over the target in a
//! single step, then `fsync` the containing directory. A crash at any point
//! leaves the target holding either its old bytes or the complete new bytes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::database::backup_naming;
use crate::database::{DatabaseError, Result, JOURNAL_SUFFIX, SIDE_FILE_SUFFIXES};

/// File extensions that identify a database file inside a safety copy
const DATABASE_EXTENSIONS: [&str; 4] = ["db", "sqlite", "sqlite3", "imsdb"];

/// Points inside a swap where a crash can be simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStage {
    /// Nothing has been written yet
    BeforeCopy,
    /// The temp sibling holds the full, synced new content
    AfterCopy,
    /// The rename is done but the directory has not been synced
    AfterRename,
}

/// Hook invoked at each [`SwapStage`]; returning an error aborts the swap there
pub type StageHook<'a> = &'a mut dyn FnMut(SwapStage) -> io::Result<()>;

fn no_hook(_: SwapStage) -> io::Result<()> {
    Ok(())
}

/// Path of `path` with `suffix` appended to its file name (`live.db` → `live.db-wal`)
pub fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn fsync_file(path: &Path) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.sync_all()
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

// Directories cannot be opened for syncing on this platform
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn copy_file_synced(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(parent_dir(dst))?;
    let bytes = fs::copy(src, dst)?;
    fsync_file(dst)?;
    Ok(bytes)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn same_device(src: &Path, dest_dir: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(src), fs::metadata(dest_dir)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_device(src: &Path, dest_dir: &Path) -> bool {
    let root = |p: &Path| {
        p.canonicalize()
            .ok()
            .and_then(|p| p.components().next().map(|c| c.as_os_str().to_os_string()))
    };
    match (root(src), root(dest_dir)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Fail with `NotWritable` unless `path` is an existing directory we can create files in
///
/// Permission bits are not trusted; a real temp file is created and removed.
pub fn ensure_writable_dir(path: &Path) -> Result<()> {
    let not_writable = |reason: String| DatabaseError::NotWritable {
        path: path.to_path_buf(),
        reason,
    };
    if !path.exists() {
        return Err(not_writable("folder does not exist".to_string()));
    }
    if !path.is_dir() {
        return Err(not_writable("not a folder".to_string()));
    }
    tempfile::Builder::new()
        .prefix(".permcheck_")
        .tempfile_in(path)
        .map(drop)
        .map_err(|e| not_writable(e.to_string()))
}

/// Free bytes on the volume holding `path`, or its nearest existing ancestor
pub fn free_space_bytes(path: &Path) -> Result<u64> {
    let probe = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(fs2::available_space(&probe)?)
}

/// Size of the file at `path` in bytes; a missing file counts as empty
pub fn db_size_bytes(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Create an empty file in `dir` that survives being closed; the caller moves or deletes it
pub fn make_temp_file(dir: &Path, suffix: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let (_file, path) = tempfile::Builder::new()
        .prefix("ims_")
        .suffix(suffix)
        .tempfile_in(dir)?
        .keep()
        .map_err(|e| DatabaseError::Io(e.error))?;
    Ok(path)
}

/// Hex encoded SHA-256 of the file content
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Move `src` to `dest` so that `dest` is never observed half written
pub fn atomic_move(src: &Path, dest: &Path) -> Result<()> {
    atomic_move_with(src, dest, &mut no_hook)
}

/// [`atomic_move`] with a hook called at every [`SwapStage`]
pub fn atomic_move_with(src: &Path, dest: &Path, hook: StageHook<'_>) -> Result<()> {
    if !src.is_file() {
        return Err(DatabaseError::SourceMissing(src.to_path_buf()));
    }
    let dest_dir = parent_dir(dest);
    fs::create_dir_all(&dest_dir)?;

    if same_device(src, &dest_dir) {
        move_same_volume(src, dest, hook)
    } else {
        move_cross_volume(src, dest, hook)
    }
}

fn move_same_volume(src: &Path, dest: &Path, hook: StageHook<'_>) -> Result<()> {
    let tmp = with_name_suffix(dest, ".tmp");
    remove_if_exists(&tmp)?;

    hook(SwapStage::BeforeCopy)?;
    fs::rename(src, &tmp)?;

    let staged = fsync_file(&tmp)
        .and_then(|_| hook(SwapStage::AfterCopy))
        .and_then(|_| fs::rename(&tmp, dest));
    if let Err(e) = staged {
        // Put the source back where the caller left it
        if let Err(restore_err) = fs::rename(&tmp, src) {
            warn!(tmp = %tmp.display(), error = %restore_err, "Failed to restore source after aborted move");
        }
        return Err(e.into());
    }

    hook(SwapStage::AfterRename)?;
    fsync_dir(&parent_dir(dest))?;
    debug!(src = %src.display(), dest = %dest.display(), "Renamed into place");
    Ok(())
}

fn move_cross_volume(src: &Path, dest: &Path, hook: StageHook<'_>) -> Result<()> {
    let tmp = with_name_suffix(dest, ".part");
    remove_if_exists(&tmp)?;

    hook(SwapStage::BeforeCopy)?;
    let staged = copy_file_synced(src, &tmp)
        .and_then(|_| hook(SwapStage::AfterCopy))
        .and_then(|_| fs::rename(&tmp, dest));
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    hook(SwapStage::AfterRename)?;
    fsync_dir(&parent_dir(dest))?;

    if let Err(e) = fs::remove_file(src) {
        warn!(src = %src.display(), error = %e, "Could not remove source after cross-volume move");
    }
    debug!(src = %src.display(), dest = %dest.display(), "Copied into place across volumes");
    Ok(())
}

/// Replace the live database at `target` with a copy of `source`
pub fn replace_db_with(source: &Path, target: &Path) -> Result<()> {
    replace_db_with_hook(source, target, &mut no_hook)
}

/// [`replace_db_with`] with a hook called at every [`SwapStage`]
///
/// Stale side files next to `target` are removed before the rename so the new
/// file is never paired with the old write-ahead log. The current database is
/// only ever replaced by the final rename; failing to do that (or to remove a
/// write-ahead log or journal) because of an open handle raises `Locked`.
pub fn replace_db_with_hook(source: &Path, target: &Path, hook: StageHook<'_>) -> Result<()> {
    if !source.is_file() {
        return Err(DatabaseError::SourceMissing(source.to_path_buf()));
    }
    let target_dir = parent_dir(target);
    fs::create_dir_all(&target_dir)?;

    let tmp = with_name_suffix(target, ".swap");
    remove_if_exists(&tmp)?;

    hook(SwapStage::BeforeCopy)?;
    let staged = copy_file_synced(source, &tmp).and_then(|_| hook(SwapStage::AfterCopy));
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    for suffix in SIDE_FILE_SUFFIXES.iter().chain(std::iter::once(&JOURNAL_SUFFIX)) {
        let stale = with_name_suffix(target, suffix);
        if let Err(e) = remove_if_exists(&stale) {
            if *suffix == "-shm" {
                warn!(path = %stale.display(), error = %e, "Could not remove stale shared-memory file");
                continue;
            }
            let _ = fs::remove_file(&tmp);
            return Err(DatabaseError::Locked(stale));
        }
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(match e.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy => {
                DatabaseError::Locked(target.to_path_buf())
            }
            _ => DatabaseError::Io(e),
        });
    }

    hook(SwapStage::AfterRename)?;
    fsync_dir(&target_dir)?;
    debug!(source = %source.display(), target = %target.display(), "Database file replaced");
    Ok(())
}

/// Copy the live database and its side files into `<db-dir>/pre-restore-<timestamp>/`
pub fn safety_copy_current_db(db_path: &Path, timestamp: &str) -> Result<PathBuf> {
    if !db_path.is_file() {
        return Err(DatabaseError::SourceMissing(db_path.to_path_buf()));
    }
    let db_dir = parent_dir(db_path);
    let mut out_dir = db_dir.join(backup_naming::safety_dir_name(timestamp));
    if out_dir.exists() {
        out_dir = db_dir.join(format!(
            "{}-{}",
            backup_naming::safety_dir_name(timestamp),
            backup_naming::random_suffix()
        ));
    }
    fs::create_dir_all(&out_dir)?;

    let file_name = db_path.file_name().unwrap_or_default();
    copy_file_synced(db_path, &out_dir.join(file_name))?;

    for suffix in SIDE_FILE_SUFFIXES {
        let side = with_name_suffix(db_path, suffix);
        if side.is_file() {
            let side_name = side.file_name().unwrap_or_default().to_os_string();
            copy_file_synced(&side, &out_dir.join(side_name))?;
        }
    }

    fsync_dir(&out_dir)?;
    fsync_dir(&db_dir)?;
    Ok(out_dir.canonicalize()?)
}

fn looks_like_database(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| DATABASE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Find the copy of `db_file_name` inside a safety directory
///
/// Falls back to the first database-looking file (by name order) when the
/// exact name is missing.
pub fn locate_original_db(safety_dir: &Path, db_file_name: &str) -> Result<PathBuf> {
    let exact = safety_dir.join(db_file_name);
    if exact.is_file() {
        return Ok(exact);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(safety_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| looks_like_database(p))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| DatabaseError::SourceMissing(exact))
}

/// Copy a write-ahead log saved next to `original` so it sits next to `target`
///
/// Used after putting a safety copy back: the saved log may hold committed
/// pages that never reached the main file. Returns whether a log was copied.
pub fn restore_saved_wal(original: &Path, target: &Path) -> Result<bool> {
    let saved = with_name_suffix(original, "-wal");
    if !saved.is_file() {
        return Ok(false);
    }
    copy_file_synced(&saved, &with_name_suffix(target, "-wal"))?;
    fsync_dir(&parent_dir(target))?;
    Ok(true)
}

/// Filesystem operations the backup and restore jobs depend on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn ensure_writable_dir(&self, path: &Path) -> Result<()>;

    async fn free_space_bytes(&self, path: &Path) -> Result<u64>;

    async fn file_size(&self, path: &Path) -> Result<u64>;

    /// Create a persistent empty temp file in `dir`
    async fn make_temp_file(&self, dir: &Path, suffix: &str) -> Result<PathBuf>;

    async fn remove_file(&self, path: &Path) -> Result<()>;

    async fn atomic_move(&self, src: &Path, dest: &Path) -> Result<()>;

    async fn replace_db_with(&self, source: &Path, target: &Path) -> Result<()>;

    async fn safety_copy_current_db(&self, db_path: &Path, timestamp: &str) -> Result<PathBuf>;

    async fn locate_original_db(&self, safety_dir: &Path, db_file_name: &str) -> Result<PathBuf>;

    async fn restore_saved_wal(&self, original: &Path, target: &Path) -> Result<bool>;

    async fn checksum(&self, path: &Path) -> Result<String>;
}

/// [`Filesystem`] backed by the local disk
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    /// Log a SHA-256 of every file made visible by a move or replace
    audit_checksums: bool,
}

impl Default for LocalFilesystem {
    fn default() -> Self {
        Self {
            audit_checksums: true,
        }
    }
}

impl LocalFilesystem {
    pub fn new(audit_checksums: bool) -> Self {
        Self { audit_checksums }
    }

    async fn audit(&self, path: PathBuf) {
        if !self.audit_checksums {
            return;
        }
        let shown = path.display().to_string();
        match blocking(move || sha256_file(&path)).await {
            Ok(digest) => info!(path = %shown, sha256 = %digest, "File checksum after swap"),
            Err(e) => warn!(path = %shown, error = %e, "Could not checksum file after swap"),
        }
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DatabaseError::Job(format!("filesystem task did not complete: {}", e)))?
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn ensure_writable_dir(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        blocking(move || ensure_writable_dir(&path)).await
    }

    async fn free_space_bytes(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        blocking(move || free_space_bytes(&path)).await
    }

    async fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn make_temp_file(&self, dir: &Path, suffix: &str) -> Result<PathBuf> {
        let (dir, suffix) = (dir.to_path_buf(), suffix.to_string());
        blocking(move || make_temp_file(&dir, &suffix)).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn atomic_move(&self, src: &Path, dest: &Path) -> Result<()> {
        let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
        let moved = dest.clone();
        blocking(move || atomic_move(&src, &dest)).await?;
        self.audit(moved).await;
        Ok(())
    }

    async fn replace_db_with(&self, source: &Path, target: &Path) -> Result<()> {
        let (source, target) = (source.to_path_buf(), target.to_path_buf());
        let replaced = target.clone();
        blocking(move || replace_db_with(&source, &target)).await?;
        self.audit(replaced).await;
        Ok(())
    }

    async fn safety_copy_current_db(&self, db_path: &Path, timestamp: &str) -> Result<PathBuf> {
        let (db_path, timestamp) = (db_path.to_path_buf(), timestamp.to_string());
        blocking(move || safety_copy_current_db(&db_path, &timestamp)).await
    }

    async fn locate_original_db(&self, safety_dir: &Path, db_file_name: &str) -> Result<PathBuf> {
        let (dir, name) = (safety_dir.to_path_buf(), db_file_name.to_string());
        blocking(move || locate_original_db(&dir, &name)).await
    }

    async fn restore_saved_wal(&self, original: &Path, target: &Path) -> Result<bool> {
        let (original, target) = (original.to_path_buf(), target.to_path_buf());
        blocking(move || restore_saved_wal(&original, &target)).await
    }

    async fn checksum(&self, path: &Path) -> Result<String> {
        let path = path.to_path_buf();
        blocking(move || sha256_file(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STAGES: [SwapStage; 3] = [
        SwapStage::BeforeCopy,
        SwapStage::AfterCopy,
        SwapStage::AfterRename,
    ];

    fn crash_at(stage: SwapStage) -> impl FnMut(SwapStage) -> io::Result<()> {
        move |current| {
            if current == stage {
                Err(io::Error::new(io::ErrorKind::Interrupted, "simulated crash"))
            } else {
                Ok(())
            }
        }
    }

    fn assert_old_or_new(dest: &Path, old: &[u8], new: &[u8]) {
        let content = fs::read(dest).unwrap();
        assert!(
            content == old || content == new,
            "destination holds {} bytes matching neither version",
            content.len()
        );
    }

    #[test]
    fn test_ensure_writable_dir() {
        let dir = tempdir().unwrap();
        ensure_writable_dir(dir.path()).unwrap();
        // The probe file must not linger
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let missing = dir.path().join("missing");
        assert!(matches!(
            ensure_writable_dir(&missing),
            Err(DatabaseError::NotWritable { .. })
        ));

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            ensure_writable_dir(&file),
            Err(DatabaseError::NotWritable { .. })
        ));
    }

    #[test]
    fn test_free_space_uses_nearest_existing_ancestor() {
        let dir = tempdir().unwrap();
        let deep = dir.path().join("a").join("b").join("c.imsdb");
        let direct = free_space_bytes(dir.path()).unwrap();
        let probed = free_space_bytes(&deep).unwrap();
        assert!(direct > 0);
        assert!(probed > 0);
    }

    #[test]
    fn test_make_temp_file_persists() {
        let dir = tempdir().unwrap();
        let path = make_temp_file(dir.path(), ".imsdb").unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".imsdb"));
        assert_eq!(db_size_bytes(&path), 0);
    }

    #[test]
    fn test_atomic_move_replaces_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("snapshot.tmp");
        let dest = dir.path().join("backup.imsdb");
        fs::write(&src, b"new content").unwrap();
        fs::write(&dest, b"old").unwrap();

        atomic_move(&src, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new content");
        assert!(!src.exists());
        assert!(!with_name_suffix(&dest, ".tmp").exists());
    }

    #[test]
    fn test_atomic_move_crash_points_same_volume() {
        for stage in STAGES {
            let dir = tempdir().unwrap();
            let src = dir.path().join("snapshot.tmp");
            let dest = dir.path().join("backup.imsdb");
            fs::write(&src, b"fully written new content").unwrap();
            fs::write(&dest, b"old content").unwrap();

            let result = move_same_volume(&src, &dest, &mut crash_at(stage));
            assert!(result.is_err(), "stage {:?} should abort", stage);
            assert_old_or_new(&dest, b"old content", b"fully written new content");

            if stage != SwapStage::AfterRename {
                // Aborted before the rename: nothing lost, nothing visible
                assert_eq!(fs::read(&dest).unwrap(), b"old content");
                assert_eq!(fs::read(&src).unwrap(), b"fully written new content");
            }
        }
    }

    #[test]
    fn test_atomic_move_crash_points_cross_volume() {
        for stage in STAGES {
            let dir = tempdir().unwrap();
            let src = dir.path().join("snapshot.tmp");
            let dest = dir.path().join("backup.imsdb");
            fs::write(&src, b"fully written new content").unwrap();
            fs::write(&dest, b"old content").unwrap();

            let result = move_cross_volume(&src, &dest, &mut crash_at(stage));
            assert!(result.is_err());
            assert_old_or_new(&dest, b"old content", b"fully written new content");
            // The source is only removed once the new content is in place
            assert!(src.exists());
            assert!(!with_name_suffix(&dest, ".part").exists() || stage == SwapStage::AfterRename);
        }
    }

    #[test]
    fn test_cross_volume_move_removes_source() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("snapshot.tmp");
        let dest = dir.path().join("out").join("backup.imsdb");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&src, b"payload").unwrap();

        move_cross_volume(&src, &dest, &mut no_hook).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!src.exists());
    }

    #[test]
    fn test_replace_db_with_removes_side_files() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("artifact.imsdb");
        let target = dir.path().join("live.db");
        fs::write(&source, b"restored").unwrap();
        fs::write(&target, b"current").unwrap();
        fs::write(with_name_suffix(&target, "-wal"), b"wal").unwrap();
        fs::write(with_name_suffix(&target, "-shm"), b"shm").unwrap();
        fs::write(with_name_suffix(&target, "-journal"), b"journal").unwrap();

        replace_db_with(&source, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"restored");
        assert!(source.exists(), "the artifact is copied, never consumed");
        for suffix in ["-wal", "-shm", "-journal", ".swap"] {
            assert!(!with_name_suffix(&target, suffix).exists(), "{suffix} left behind");
        }
    }

    #[test]
    fn test_replace_db_with_crash_points() {
        for stage in STAGES {
            let dir = tempdir().unwrap();
            let source = dir.path().join("artifact.imsdb");
            let target = dir.path().join("live.db");
            fs::write(&source, b"restored database bytes").unwrap();
            fs::write(&target, b"current database bytes").unwrap();

            let result = replace_db_with_hook(&source, &target, &mut crash_at(stage));
            assert!(result.is_err());
            assert_old_or_new(&target, b"current database bytes", b"restored database bytes");
        }
    }

    #[test]
    fn test_replace_db_with_missing_source() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("live.db");
        fs::write(&target, b"current").unwrap();
        let err = replace_db_with(&dir.path().join("nope.imsdb"), &target).unwrap_err();
        assert!(matches!(err, DatabaseError::SourceMissing(_)));
        assert_eq!(fs::read(&target).unwrap(), b"current");
    }

    #[test]
    fn test_safety_copy_includes_side_files() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("live.db");
        fs::write(&db, b"main").unwrap();
        fs::write(with_name_suffix(&db, "-wal"), b"wal").unwrap();

        let out = safety_copy_current_db(&db, "20250601-143000").unwrap();
        assert!(out.ends_with("pre-restore-20250601-143000"));
        assert_eq!(fs::read(out.join("live.db")).unwrap(), b"main");
        assert_eq!(fs::read(out.join("live.db-wal")).unwrap(), b"wal");
        assert!(!out.join("live.db-shm").exists());

        // Same timestamp again gets its own folder
        let again = safety_copy_current_db(&db, "20250601-143000").unwrap();
        assert_ne!(out, again);
    }

    #[test]
    fn test_rollback_puts_saved_wal_back() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("live.db");
        fs::write(&db, b"main").unwrap();
        fs::write(with_name_suffix(&db, "-wal"), b"wal").unwrap();
        let out = safety_copy_current_db(&db, "20250601-143000").unwrap();

        fs::write(dir.path().join("restored.imsdb"), b"restored").unwrap();
        replace_db_with(&dir.path().join("restored.imsdb"), &db).unwrap();
        assert!(!with_name_suffix(&db, "-wal").exists());

        let original = locate_original_db(&out, "live.db").unwrap();
        replace_db_with(&original, &db).unwrap();
        assert!(restore_saved_wal(&original, &db).unwrap());
        assert_eq!(fs::read(&db).unwrap(), b"main");
        assert_eq!(fs::read(with_name_suffix(&db, "-wal")).unwrap(), b"wal");

        fs::remove_file(out.join("live.db-wal")).unwrap();
        assert!(!restore_saved_wal(&original, &db).unwrap());
    }

    #[test]
    fn test_safety_copy_missing_source() {
        let dir = tempdir().unwrap();
        let err = safety_copy_current_db(&dir.path().join("live.db"), "ts").unwrap_err();
        assert!(matches!(err, DatabaseError::SourceMissing(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_locate_original_db_falls_back_to_database_looking_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("other.db-wal"), b"wal").unwrap();
        fs::write(dir.path().join("other.db"), b"db").unwrap();
        fs::write(dir.path().join("notes.txt"), b"txt").unwrap();

        let found = locate_original_db(dir.path(), "live.db").unwrap();
        assert_eq!(found, dir.path().join("other.db"));

        fs::write(dir.path().join("live.db"), b"db").unwrap();
        let found = locate_original_db(dir.path(), "live.db").unwrap();
        assert_eq!(found, dir.path().join("live.db"));

        let empty = tempdir().unwrap();
        assert!(locate_original_db(empty.path(), "live.db").is_err());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_local_filesystem_moves_and_checksums() {
        let dir = tempdir().unwrap();
        let fs_ops = LocalFilesystem::default();
        let tmp = fs_ops.make_temp_file(dir.path(), ".imsdb").await.unwrap();
        fs::write(&tmp, b"abc").unwrap();
        let dest = dir.path().join("backup.imsdb");

        fs_ops.atomic_move(&tmp, &dest).await.unwrap();
        assert_eq!(fs_ops.file_size(&dest).await.unwrap(), 3);
        assert_eq!(
            fs_ops.checksum(&dest).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        fs_ops.remove_file(&dest).await.unwrap();
        fs_ops.remove_file(&dest).await.unwrap();
    }
}
