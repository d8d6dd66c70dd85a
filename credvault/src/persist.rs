//! Whole-file JSON persistence shared by the key registry and the credential
//! store.
//!
//! Every container lives in one file that is rewritten in full. Writers take an
//! exclusive advisory lock on a sidecar `<file>.lock` for the whole
//! load/mutate/persist sequence and replace the file through a rename, so a
//! reader never sees a partially written container.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),
    #[error("io error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to lock {}: {source}", .path.display())]
    Lock { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to serialize {}: {source}", .path.display())]
    Serialize { path: PathBuf, source: serde_json::Error },
}

impl PersistError {
    /// True when the container file does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistError::NotFound(_))
    }
}

/// A JSON container at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads the container under a shared lock. A missing file is
    /// [`PersistError::NotFound`]; an empty body or `null` is `T::default()`.
    ///
    /// When the sidecar lock file cannot be opened (read-only directory), the
    /// container is read without a lock.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T, PersistError> {
        if !self.exists() {
            return Err(PersistError::NotFound(self.path.clone()));
        }
        let lock_path = lock_path_for(&self.path);
        match open_lock_file(&lock_path) {
            Ok(lock_file) => self.acquire(lock_file, lock_path, LockMode::Shared)?.read(),
            Err(err) => {
                warn!(path = %lock_path.display(), error = %err, "lock file unavailable; reading unlocked");
                read_container(&self.path)
            }
        }
    }

    /// Replaces the container with `value` under an exclusive lock.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), PersistError> {
        let guard = self.lock_exclusive()?;
        guard.write(value)
    }

    /// Takes the writer lock, creating parent directories as needed. Hold the
    /// guard across a read-modify-write cycle.
    pub fn lock_exclusive(&self) -> Result<LockedFile<'_>, PersistError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        self.lock(LockMode::Exclusive)
    }

    fn lock(&self, mode: LockMode) -> Result<LockedFile<'_>, PersistError> {
        let lock_path = lock_path_for(&self.path);
        let lock_file = open_lock_file(&lock_path).map_err(|source| PersistError::Lock {
            path: lock_path.clone(),
            source,
        })?;
        self.acquire(lock_file, lock_path, mode)
    }

    fn acquire(&self, lock_file: File, lock_path: PathBuf, mode: LockMode) -> Result<LockedFile<'_>, PersistError> {
        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&lock_file),
            LockMode::Exclusive => FileExt::lock_exclusive(&lock_file),
        };
        locked.map_err(|source| PersistError::Lock {
            path: lock_path,
            source,
        })?;

        Ok(LockedFile {
            file: self,
            lock_file,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Holds the advisory lock for a [`JsonFile`] until dropped.
pub struct LockedFile<'a> {
    file: &'a JsonFile,
    lock_file: File,
}

impl LockedFile<'_> {
    pub fn read<T: DeserializeOwned + Default>(&self) -> Result<T, PersistError> {
        read_container(&self.file.path)
    }

    pub fn write<T: Serialize>(&self, value: &T) -> Result<(), PersistError> {
        let path = &self.file.path;
        let mut body = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize {
            path: path.clone(),
            source,
        })?;
        body.push(b'\n');

        let io_err = |source: io::Error| PersistError::Io {
            path: path.clone(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // NamedTempFile is created 0600, which the rename carries over.
        let mut staged = NamedTempFile::new_in(dir).map_err(io_err)?;
        staged.write_all(&body).map_err(io_err)?;
        staged.as_file().sync_all().map_err(io_err)?;
        staged.persist(path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), bytes = body.len(), "persisted container");
        Ok(())
    }
}

impl Drop for LockedFile<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn read_container<T: DeserializeOwned + Default>(path: &Path) -> Result<T, PersistError> {
    let content = fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => PersistError::NotFound(path.to_path_buf()),
        _ => PersistError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    debug!(path = %path.display(), bytes = content.len(), "loaded container");

    if content.trim().is_empty() {
        return Ok(T::default());
    }
    let parsed: Option<T> = serde_json::from_str(&content).map_err(|source| PersistError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parsed.unwrap_or_default())
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}
