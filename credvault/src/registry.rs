//! Registry of symmetric keys, one per system name.
//!
//! The registry file maps each system name to its base64 key and is rewritten
//! in full whenever a key is generated. Rotating a key only replaces the
//! registry entry: anything encrypted under the previous key stays as it is
//! and can no longer be opened with the registry's current key.

use std::collections::btree_map::{self, BTreeMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::crypto::keys::{KeyError, SecurityKey};
use crate::persist::{JsonFile, LockedFile, PersistError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("key registry error: {0}")]
    Persist(#[from] PersistError),
    #[error("no key registered for system {0:?}")]
    UnknownSystem(String),
    #[error("key for system {system:?} is unusable: {source}")]
    InvalidKey { system: String, source: KeyError },
}

impl RegistryError {
    /// True when the registry file has never been written.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Persist(err) if err.is_not_found())
    }
}

/// In-memory mapping from system name to its active key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KeyRegistry {
    keys: BTreeMap<String, SecurityKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, system_name: &str) -> Option<&SecurityKey> {
        self.keys.get(system_name)
    }

    /// Like [`get`](Self::get), but a missing entry is an error.
    pub fn require(&self, system_name: &str) -> Result<&SecurityKey, RegistryError> {
        self.get(system_name)
            .ok_or_else(|| RegistryError::UnknownSystem(system_name.to_string()))
    }

    pub fn contains(&self, system_name: &str) -> bool {
        self.keys.contains_key(system_name)
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, SecurityKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Builds a registry from the persisted name to base64 form.
    pub fn from_encoded(encoded: BTreeMap<String, String>) -> Result<Self, RegistryError> {
        let keys = encoded
            .into_iter()
            .map(|(system, text)| match SecurityKey::from_encoded(&text) {
                Ok(key) => Ok((system, key)),
                Err(source) => Err(RegistryError::InvalidKey { system, source }),
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Self { keys })
    }

    /// Installs `key` for `system_name`, returning the key it superseded.
    pub fn insert(&mut self, system_name: impl Into<String>, key: SecurityKey) -> Option<SecurityKey> {
        self.keys.insert(system_name.into(), key)
    }
}

/// Persistent home of a [`KeyRegistry`].
#[derive(Debug, Clone)]
pub struct KeyRegistryStore {
    file: JsonFile,
}

impl KeyRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Generates a fresh key for `system_name`, installs it in `existing` (or
    /// an empty registry) and persists the result, replacing whatever the
    /// registry file held before.
    ///
    /// `existing` is written as given: a snapshot loaded earlier loses any
    /// system another writer added since. Use [`install_key`](Self::install_key)
    /// to add a key to the registry as it is on disk.
    pub fn generate_key(&self, system_name: &str, existing: Option<KeyRegistry>) -> Result<KeyRegistry, RegistryError> {
        let mut registry = existing.unwrap_or_default();
        let guard = self.file.lock_exclusive()?;
        install_new_key(&mut registry, system_name);
        guard.write(&registry)?;
        Ok(registry)
    }

    /// Loads the persisted registry. Fails with a not-found error when the
    /// registry file does not exist; an empty file is an empty registry.
    pub fn load(&self) -> Result<KeyRegistry, RegistryError> {
        KeyRegistry::from_encoded(self.file.load()?)
    }

    /// Replaces the key for `system_name` in the persisted registry. The
    /// registry must already exist.
    pub fn rotate_key(&self, system_name: &str) -> Result<KeyRegistry, RegistryError> {
        if !self.file.exists() {
            return Err(PersistError::NotFound(self.path().to_path_buf()).into());
        }
        let guard = self.file.lock_exclusive()?;
        let mut registry = read_locked(&guard)?;
        install_new_key(&mut registry, system_name);
        guard.write(&registry)?;
        Ok(registry)
    }

    /// Generates a key for `system_name` in the registry as persisted, creating
    /// the registry file if needed. Read and write happen under one exclusive
    /// lock, so concurrent callers never drop each other's systems.
    pub fn install_key(&self, system_name: &str) -> Result<KeyRegistry, RegistryError> {
        let guard = self.file.lock_exclusive()?;
        let mut registry = match read_locked(&guard) {
            Err(err) if err.is_not_found() => KeyRegistry::default(),
            other => other?,
        };
        install_new_key(&mut registry, system_name);
        guard.write(&registry)?;
        Ok(registry)
    }

    /// Loads the registry, or starts an empty one if the file is missing.
    pub fn load_or_default(&self) -> Result<KeyRegistry, RegistryError> {
        match self.load() {
            Err(err) if err.is_not_found() => Ok(KeyRegistry::default()),
            other => other,
        }
    }
}

fn read_locked(guard: &LockedFile<'_>) -> Result<KeyRegistry, RegistryError> {
    KeyRegistry::from_encoded(guard.read()?)
}

fn install_new_key(registry: &mut KeyRegistry, system_name: &str) {
    let key = SecurityKey::generate();
    let fingerprint = key.fingerprint();
    match registry.insert(system_name, key) {
        Some(previous) => info!(
            system = system_name,
            fingerprint = %fingerprint,
            previous = %previous.fingerprint(),
            "rotated key"
        ),
        None => info!(system = system_name, fingerprint = %fingerprint, "generated key"),
    }
}
