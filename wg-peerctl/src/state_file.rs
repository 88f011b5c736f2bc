// Whole-file persistence helpers
//!
//! The peer config and the expiration ledger are both rewritten wholesale.
//! Writes go to a temporary file in the same directory which is synced and
//! renamed over the target, so readers only ever see the old or the new file.
//!
//! Writers in different processes (daemon and CLI) serialize on an exclusive
//! advisory lock held on a `<file>.lock` sibling for the whole
//! read-modify-write.

use crate::error::{PeerError, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Read a whole file, returning `None` if it does not exist
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PeerError::io("Failed to read file", path, e)),
    }
}

/// Replace `path` with `contents` atomically
///
/// The parent directory is created if needed and the permissions of an
/// existing file are carried over to the replacement.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| PeerError::io("Failed to create directory", dir, e))?;
    }

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| PeerError::io("Failed to create temporary file", dir, e))?;

    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file()
            .set_permissions(meta.permissions())
            .map_err(|e| PeerError::io("Failed to copy permissions", tmp.path(), e))?;
    }

    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PeerError::io("Failed to write temporary file", dir, e))?;

    // Dropping the guard on any error above removes the temporary file
    tmp.persist(path)
        .map_err(|e| PeerError::io("Failed to replace file", path, e.error))?;

    Ok(())
}

/// `/etc/wireguard/wg0.conf` -> `/etc/wireguard/wg0.conf.lock`
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive advisory lock guarding a file; released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock for `target` is held by this process
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path(target);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| PeerError::io("Failed to create directory", dir, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PeerError::io("Failed to open lock file", &path, e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| PeerError::io("Failed to lock", &path, e))?;

        log::debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }

    /// Acquire on the blocking pool so the runtime keeps running while
    /// another process holds the lock
    pub async fn acquire_async(target: &Path) -> Result<Self> {
        let owned = target.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire(&owned))
            .await
            .map_err(|e| PeerError::io("Lock task failed", lock_path(target), std::io::Error::other(e)))?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
