// zrb_common is the main zrb library implementing the backup pipeline shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::manifest::{read_yaml, write_yaml_atomic};
use crate::ZrbError;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// A `LockEntry` records one process holding a dataset lock.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    /// The pid of the holding process.
    pub pid: u32,
    /// The pool of the locked dataset.
    pub pool: String,
    /// The locked dataset, relative to the pool.
    pub dataset: String,
    /// When the lock was taken.
    pub started_at: DateTime<Utc>,
}

/// A `LockGuard` represents cooperative ownership of a dataset lock.
///
/// The lock is released when the guard is dropped. Call
/// [`LockGuard::release`] explicitly to observe release errors.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    pool: String,
    dataset: String,
    released: bool,
}

impl LockGuard {
    /// Releases the lock, removing the caller's entry from the lock file
    /// and deleting the file if no entries remain.
    ///
    /// Releasing an already released guard is a no-op.
    pub fn release(&mut self) -> Result<(), ZrbError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut entries = read_entries(&self.path)?;
        entries.retain(|entry| {
            entry.pid != self.pid || entry.pool != self.pool || entry.dataset != self.dataset
        });

        if entries.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            write_yaml_atomic(&self.path, &entries)
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release().ok();
    }
}

/// Acquires the dataset lock at `lock_path` for the current process.
///
/// Entries of processes that no longer exist are reclaimed. Fails with
/// [`ZrbError::Locked`] if a live process already holds the same dataset.
pub fn acquire(lock_path: &Path, pool: &str, dataset: &str) -> Result<LockGuard, ZrbError> {
    let mut entries = read_entries(lock_path)?;

    entries.retain(|entry| {
        let alive = pid_alive(entry.pid);
        if !alive {
            log::info!(
                "Reclaiming stale lock entry of dead pid {} for {}/{}",
                entry.pid,
                entry.pool,
                entry.dataset
            );
        }
        alive
    });

    if let Some(holder) = entries
        .iter()
        .find(|entry| entry.pool == pool && entry.dataset == dataset)
    {
        return Err(ZrbError::Locked {
            pid: holder.pid,
            started_at: holder.started_at.to_rfc3339(),
        });
    }

    let pid = std::process::id();
    entries.push(LockEntry {
        pid,
        pool: pool.to_string(),
        dataset: dataset.to_string(),
        started_at: Utc::now(),
    });

    write_yaml_atomic(lock_path, &entries)?;

    Ok(LockGuard {
        path: lock_path.to_path_buf(),
        pid,
        pool: pool.to_string(),
        dataset: dataset.to_string(),
        released: false,
    })
}

fn read_entries(path: &Path) -> Result<Vec<LockEntry>, ZrbError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    read_yaml(path)
}

/// Reports whether a process with the given pid exists.
/// A failed permission check means the process exists but is foreign,
/// which still counts as alive.
fn pid_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::process::{Command, Stdio};

    fn lock_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zrb.lock");
        (dir, path)
    }

    #[test]
    fn acquire_and_release_removes_file() {
        let (_dir, path) = lock_file();

        let mut guard = acquire(&path, "tank", "data").unwrap();
        assert!(path.exists());

        guard.release().unwrap();
        assert!(!path.exists());

        // Releasing twice is fine.
        guard.release().unwrap();
    }

    #[test]
    fn live_holder_blocks_same_dataset() {
        let (_dir, path) = lock_file();

        let _guard = acquire(&path, "tank", "data").unwrap();
        let result = acquire(&path, "tank", "data");

        match result {
            Err(ZrbError::Locked { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Locked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn other_dataset_is_not_blocked() {
        let (_dir, path) = lock_file();

        let _guard = acquire(&path, "tank", "data").unwrap();
        let other = acquire(&path, "tank", "media").unwrap();
        drop(other);

        // Our own entry must survive the other release.
        let entries: Vec<LockEntry> = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dataset, "data");
    }

    #[test]
    fn stale_entry_is_reclaimed() {
        let (_dir, path) = lock_file();

        // A pid that is guaranteed to be dead by the time we probe it.
        let dead_pid = {
            let mut child = Command::new("true").stdin(Stdio::null()).spawn().unwrap();
            let pid = child.id();
            child.wait().unwrap();
            pid
        };

        let entries = vec![LockEntry {
            pid: dead_pid,
            pool: "tank".to_string(),
            dataset: "data".to_string(),
            started_at: Utc::now(),
        }];
        write_yaml_atomic(&path, &entries).unwrap();

        let guard = acquire(&path, "tank", "data").unwrap();
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn drop_releases_lock() {
        let (_dir, path) = lock_file();

        {
            let _guard = acquire(&path, "tank", "data").unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }
}
