//! JSON snapshot files shared by the file-backed stores.
//!
//! Writers from several processes coordinate through an advisory lock on a
//! sibling `.lock` file. Readers need no lock since snapshots are replaced
//! by rename.

use crate::core::PersistenceError;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::task;

type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Reads a snapshot, `None` when the file does not exist yet.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }

    let bytes = fs::read(path).await.map_err(|err| {
        PersistenceError::Io(format!("Failed to read '{}': {}", path.display(), err))
    })?;
    let value = serde_json::from_slice::<T>(&bytes).map_err(|err| {
        PersistenceError::Serialization(format!("parse '{}': {}", path.display(), err))
    })?;
    Ok(Some(value))
}

/// Writes the snapshot to a temporary file and atomically renames it to `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await.map_err(|err| {
            PersistenceError::Io(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).await.map_err(|err| {
        PersistenceError::Io(format!("Failed to write temp file '{}': {}", tmp.display(), err))
    })?;
    fs::rename(&tmp, path).await.map_err(|err| {
        PersistenceError::Io(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

/// Exclusive advisory lock on a snapshot. Released on drop.
#[derive(Debug)]
pub struct SnapshotLock {
    _file: File,
}

pub fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

/// Waits until the lock for the snapshot at `path` is free and takes it.
pub async fn lock_exclusive(path: &Path) -> StoreResult<SnapshotLock> {
    let lock_path = lock_path(path);
    task::spawn_blocking(move || {
        let file = open_lock_file(&lock_path)?;
        file.lock_exclusive().map_err(|err| {
            PersistenceError::LockError(format!("lock '{}': {}", lock_path.display(), err))
        })?;
        Ok(SnapshotLock { _file: file })
    })
    .await
    .map_err(|err| PersistenceError::LockError(format!("lock task failed: {}", err)))?
}

/// Takes the lock for the snapshot at `path`, `None` when someone else holds it.
pub async fn try_lock_exclusive(path: &Path) -> StoreResult<Option<SnapshotLock>> {
    let lock_path = lock_path(path);
    task::spawn_blocking(move || {
        let file = open_lock_file(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(SnapshotLock { _file: file })),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Ok(None)
            }
            Err(err) => Err(PersistenceError::LockError(format!(
                "lock '{}': {}",
                lock_path.display(),
                err
            ))),
        }
    })
    .await
    .map_err(|err| PersistenceError::LockError(format!("lock task failed: {}", err)))?
}

fn open_lock_file(lock_path: &Path) -> StoreResult<File> {
    if let Some(parent) = lock_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|err| {
            PersistenceError::Io(format!("Failed to open '{}': {}", lock_path.display(), err))
        })
}
