//! Configuration loader. Resolves where the key registry and the credential
//! store live and hands out the store objects bound to those paths.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::registry::KeyRegistryStore;
use crate::store::CredentialStore;

pub const DEFAULT_KEYS_FILE: &str = "security_keys.json";
pub const DEFAULT_CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct RawVaultConfig {
    #[serde(rename = "keysPath")]
    keys_path: Option<PathBuf>,
    #[serde(rename = "credentialsPath")]
    credentials_path: Option<PathBuf>,
}

/// File locations for one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    pub keys_path: PathBuf,
    pub credentials_path: PathBuf,
}

impl VaultConfig {
    /// Default file names inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            keys_path: dir.join(DEFAULT_KEYS_FILE),
            credentials_path: dir.join(DEFAULT_CREDENTIALS_FILE),
        }
    }

    /// Reads a JSON config file. Relative paths are resolved against the
    /// directory holding the config file, and omitted paths take the defaults
    /// from [`in_dir`](Self::in_dir).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw_json = fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let raw: RawVaultConfig = serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let defaults = Self::in_dir(base);
        Ok(Self {
            keys_path: raw.keys_path.map(|p| base.join(p)).unwrap_or(defaults.keys_path),
            credentials_path: raw
                .credentials_path
                .map(|p| base.join(p))
                .unwrap_or(defaults.credentials_path),
        })
    }

    pub fn key_registry(&self) -> KeyRegistryStore {
        KeyRegistryStore::new(&self.keys_path)
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(&self.credentials_path)
    }
}
