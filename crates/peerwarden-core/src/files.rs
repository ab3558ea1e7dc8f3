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

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock {path}: {errno}")]
    Lock { path: PathBuf, errno: nix::errno::Errno },

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("malformed file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl FileError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An OS advisory lock on a file, released when dropped.
///
/// These locks are the only exclusion that reaches other processes, such as
/// the external administrative tool, so every writer of a shared file takes
/// one for the whole read-modify-write.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl FileLock {
    pub fn exclusive(path: &Path) -> Result<Self, FileError> {
        Self::acquire(path, FlockArg::LockExclusive)
    }

    pub fn shared(path: &Path) -> Result<Self, FileError> {
        Self::acquire(path, FlockArg::LockShared)
    }

    fn acquire(path: &Path, arg: FlockArg) -> Result<Self, FileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| FileError::io(path, e))?;

        let lock = Flock::lock(file, arg).map_err(|(_, errno)| FileError::Lock {
            path: path.to_path_buf(),
            errno,
        })?;
        debug!(path = %path.display(), "acquired file lock");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sibling lock file used to guard `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Replace `path` with `contents` via a temp file and rename, mode 0600.
pub fn write_private(path: &Path, contents: &str) -> Result<(), FileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(|e| FileError::io(&tmp, e))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| FileError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| FileError::io(path, e))
}

/// Create `path` with `contents`, failing if it already exists.
pub fn create_private(path: &Path, contents: &str) -> Result<(), FileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FileError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => FileError::AlreadyExists(path.to_path_buf()),
            _ => FileError::io(path, e),
        })?;
    file.write_all(contents.as_bytes())
        .map_err(|e| FileError::io(path, e))
}

/// Read a file, mapping absence to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>, FileError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FileError::io(path, e)),
    }
}

/// Remove a file, treating absence as success. Returns whether it existed.
pub fn remove_optional(path: &Path) -> Result<bool, FileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FileError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_sibling() {
        assert_eq!(
            lock_path_for(Path::new("/etc/wireguard/wg0.conf")),
            PathBuf::from("/etc/wireguard/wg0.conf.lock")
        );
    }

    #[test]
    fn create_private_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.conf");
        create_private(&path, "one").unwrap();
        assert!(matches!(
            create_private(&path, "two"),
            Err(FileError::AlreadyExists(_))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");
    }

    #[test]
    fn write_private_replaces_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.conf");
        write_private(&path, "one").unwrap();
        write_private(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        {
            let _held = FileLock::exclusive(&path).unwrap();
        }
        let again = FileLock::exclusive(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn remove_optional_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_optional(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_optional(&path).unwrap());
    }
}
