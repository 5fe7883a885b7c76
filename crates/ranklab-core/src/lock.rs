//! Advisory per-experiment locking.
//!
//! Repair holds an exclusive flock on a hidden lockfile inside the
//! experiment directory so two repair invocations cannot interleave writes.
//! The lock is advisory: plain `run` passes do not take it, matching the
//! expectation that repairs happen on quiescent directories.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::domain::{RanklabError, Result};
use crate::layout::LOCK_FILE;

/// An exclusive advisory lock on an experiment directory.
///
/// Released on drop. A second acquisition attempt while the lock is held
/// (in this process or another) fails fast with [`RanklabError::LockBusy`]
/// rather than blocking.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Try to take the lock, failing immediately if it is already held.
    pub fn acquire(experiment_dir: &Path) -> Result<Self> {
        let path = experiment_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| RanklabError::LockBusy {
            path: path.clone(),
        })?;
        debug!(path = %path.display(), "acquired experiment lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let held = DirLock::acquire(dir.path()).unwrap();
        let second = DirLock::acquire(dir.path());
        assert!(matches!(second, Err(RanklabError::LockBusy { .. })));
        drop(held);
        DirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_lockfile_lands_inside_experiment_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        assert!(lock.path().starts_with(dir.path()));
        assert!(lock.path().exists());
    }
}
