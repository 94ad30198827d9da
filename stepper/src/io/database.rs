//! Isolation of the project's task database for one step.
//!
//! The agent works against a private copy; the canonical file is only touched
//! again when the copy is merged back, which is a whole-file overwrite rather
//! than a row-level merge. Correctness relies on nothing else writing the
//! canonical file during the cycle.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::naming::{is_temp_database_file_name, temp_database_file_name, unique_token};
use crate::error::{Result, StepError};

/// Sidecar files SQLite may leave next to a database.
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Diagnostics snapshot of a database file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    /// Permission bits; off unix only the read-only flag is reflected (`0o444`/`0o644`).
    pub permissions: u32,
    /// User tables, sorted by name.
    pub tables: Vec<String>,
}

/// Copy `source` to a new temp-convention path under the system temp directory.
pub fn create_temp_database_copy(source: &Path, prefix: &str) -> Result<PathBuf> {
    create_temp_database_copy_in(&std::env::temp_dir(), source, prefix)
}

/// Like [`create_temp_database_copy`], rooted at `base_dir`.
#[instrument(skip_all, fields(source = %source.display(), prefix))]
pub fn create_temp_database_copy_in(base_dir: &Path, source: &Path, prefix: &str) -> Result<PathBuf> {
    if !source.is_file() {
        return Err(StepError::corrupt(source, "source database does not exist"));
    }
    fs::create_dir_all(base_dir)?;
    let temp_path = base_dir.join(temp_database_file_name(prefix, &unique_token()));
    copy_database(source, &temp_path)?;
    info!(temp = %temp_path.display(), "isolated database copy created");
    Ok(temp_path)
}

/// Overwrite `dst` with the full contents of `src`.
///
/// Stale sidecar files of `dst` are removed so SQLite cannot replay an old
/// journal over the new contents.
#[instrument(skip_all, fields(src = %src.display(), dst = %dst.display()))]
pub fn copy_database(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_file() {
        return Err(StepError::corrupt(src, "source database does not exist"));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(src, dst)?;
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = sidecar_path(dst, suffix);
        if sidecar.exists() {
            debug!(sidecar = %sidecar.display(), "removing stale sidecar");
            fs::remove_file(&sidecar)?;
        }
    }
    debug!(bytes, "database copied");
    Ok(())
}

/// Run the engine's integrity check; anything other than a single `ok` is corruption.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn verify_database_integrity(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|err| StepError::corrupt(path, err.to_string()))?;
    if !meta.is_file() {
        return Err(StepError::corrupt(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(StepError::corrupt(path, "file is empty"));
    }
    let conn = open_read_only(path)?;
    let results = integrity_check(&conn).map_err(|err| StepError::corrupt(path, err.to_string()))?;
    if results.len() == 1 && results[0] == "ok" {
        debug!("integrity check ok");
        return Ok(());
    }
    warn!(problems = results.len(), "integrity check failed");
    Err(StepError::corrupt(path, results.join("; ")))
}

/// Delete a temp database copy. Refuses any path outside the temp naming convention.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn cleanup_temp_database(path: &Path) -> Result<()> {
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
    if !is_temp_database_file_name(file_name) {
        return Err(StepError::validation(format!(
            "refusing to delete {}: not a temporary database copy",
            path.display()
        )));
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("temp database already gone");
        }
        Err(err) => return Err(err.into()),
    }
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = sidecar_path(path, suffix);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
    }
    debug!("temp database removed");
    Ok(())
}

/// Size, modification time, permissions and table names, for diagnostics.
pub fn get_database_info(path: &Path) -> Result<DatabaseInfo> {
    let meta = fs::metadata(path)?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    let conn = open_read_only(path)?;
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DatabaseInfo {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        modified,
        permissions: permission_bits(&meta),
        tables,
    })
}

fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| StepError::corrupt(path, err.to_string()))
}

fn integrity_check(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let results = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>();
    results
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}
