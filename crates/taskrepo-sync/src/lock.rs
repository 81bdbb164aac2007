//! Exclusive per-repository session lock.
//!
//! Two layers: an in-process registry of async mutexes keyed by lock file,
//! and an advisory `fs2` lock on that file so separate processes exclude
//! each other too.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Held for the duration of a sync or snapshot read. Dropping releases both layers.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    file: File,
    _guard: OwnedMutexGuard<()>,
}

impl RepoLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "Failed to release lock file");
        }
        debug!(path = %self.path.display(), "Released repository lock");
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    slots: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(path.to_path_buf()).or_default().clone()
    }

    /// Take the lock or fail immediately if a session already holds it.
    pub fn try_acquire(&self, lock_file: &Path) -> Result<RepoLock, SyncError> {
        let guard = self.slot(lock_file).try_lock_owned().map_err(|_| busy(lock_file, "in this process"))?;
        let file = open_lock_file(lock_file)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                return Err(busy(lock_file, "by another process"));
            }
            Err(err) => return Err(err.into()),
        }
        debug!(path = %lock_file.display(), "Acquired repository lock");
        Ok(RepoLock {
            path: lock_file.to_path_buf(),
            file,
            _guard: guard,
        })
    }

    /// Wait until the lock is free.
    pub async fn acquire(&self, lock_file: &Path) -> Result<RepoLock, SyncError> {
        let guard = self.slot(lock_file).lock_owned().await;
        let file = open_lock_file(lock_file)?;
        let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
            .await
            .map_err(|err| SyncError::Io(io::Error::other(err)))??;
        Ok(RepoLock {
            path: lock_file.to_path_buf(),
            file,
            _guard: guard,
        })
    }
}

fn busy(lock_file: &Path, holder: &str) -> SyncError {
    SyncError::RepositoryState {
        reason: format!("a sync is already running {holder}"),
        files: vec![lock_file.to_path_buf()],
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}
