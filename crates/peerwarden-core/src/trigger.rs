// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cross-process "re-apply the shared config" signal.
//!
//! The host-side reconciler watches the trigger file's modification time and
//! re-applies the shared interface config whenever it changes. There is no
//! payload.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::files::{FileError, FileLock, lock_path_for};

#[derive(Debug, Clone)]
pub struct Trigger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Trigger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the trigger file's mtime under an exclusive lock.
    pub fn raise(&self) -> Result<(), FileError> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| FileError::io(&self.path, e))?;
        file.set_modified(SystemTime::now())
            .map_err(|e| FileError::io(&self.path, e))?;
        info!(path = %self.path.display(), "raised reconciliation trigger");
        Ok(())
    }

    pub fn last_raised(&self) -> Option<SystemTime> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        debug!(path = %self.path.display(), ?modified, "read trigger timestamp");
        modified
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn raise_creates_then_advances_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = Trigger::new(dir.path().join("state/reconcile.trigger"));
        assert!(trigger.last_raised().is_none());

        trigger.raise().unwrap();
        let first = trigger.last_raised().unwrap();

        // Push the recorded time into the past so the second raise is observable
        // regardless of filesystem timestamp granularity.
        let file = OpenOptions::new().write(true).open(trigger.path()).unwrap();
        file.set_modified(first - Duration::from_secs(60)).unwrap();

        trigger.raise().unwrap();
        assert!(trigger.last_raised().unwrap() > first - Duration::from_secs(60));
    }

    #[test]
    fn concurrent_raises_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = Trigger::new(dir.path().join("reconcile.trigger"));
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| trigger.raise().unwrap());
            }
        });
        assert!(trigger.last_raised().is_some());
    }
}
