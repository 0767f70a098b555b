//! Per-directory exclusive leases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::task::RepositoryRef;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to prepare workspace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One lock per working directory in use or waited on.
type LockMap = Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>;

/// Hands out exclusive leases on repository working directories.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    locks: Arc<LockMap>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    /// Working directory for `repo`: `<root>/<owner>__<name>`.
    pub fn path_for(&self, repo: &RepositoryRef) -> PathBuf {
        self.root.join(repo.dir_name())
    }

    /// Wait for exclusive use of `repo`'s working directory.
    ///
    /// The root is created if missing; the directory itself is left to the
    /// clone step. Dropping the returned future gives up the wait.
    pub async fn acquire(&self, repo: &RepositoryRef) -> Result<WorkdirLease, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;

        let path = self.path_for(repo);
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks left behind by abandoned waits.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(path.clone()).or_default())
        };

        debug!(path = %path.display(), "Waiting for workdir lease");
        let guard = lock.lock_owned().await;
        debug!(path = %path.display(), "Workdir lease acquired");
        Ok(WorkdirLease {
            path,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Whether some task currently holds `repo`'s directory.
    pub fn is_leased(&self, repo: &RepositoryRef) -> bool {
        let path = self.path_for(repo);
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(&path).is_some_and(|lock| lock.try_lock().is_err())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive use of one working directory; released on drop.
#[derive(Debug)]
pub struct WorkdirLease {
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl WorkdirLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkdirLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map's own reference is the last one: nobody holds or awaits it.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
        debug!(path = %self.path.display(), "Workdir lease released");
    }
}
