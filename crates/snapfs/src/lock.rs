// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Advisory per-directory run lock
//!
//! Concurrent runs against one snapshot directory would race on snapshot
//! creation and deletion. The lock is advisory (`flock`), held for the
//! life of the run, and released by the kernel even if the process dies.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::{FsError, Result};

const LOCK_FILE_NAME: &str = ".snapship.lock";

pub struct DirLock {
    _lock: Flock<std::fs::File>,
    path: PathBuf,
}

impl DirLock {
    /// Take the exclusive lock for `dir`, failing fast when another run
    /// holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(DirLock { _lock: lock, path }),
            Err((_, Errno::EWOULDBLOCK)) => Err(FsError::Locked(dir.to_path_buf())),
            Err((_, errno)) => Err(FsError::Io(std::io::Error::from_raw_os_error(errno as i32))),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let held = DirLock::acquire(dir.path()).unwrap();
        assert!(matches!(DirLock::acquire(dir.path()), Err(FsError::Locked(_))));
        drop(held);
        DirLock::acquire(dir.path()).unwrap();
    }
}
