//! Encrypted credential store.
//!
//! Maps credential names to tokens produced by [`CredentialCipher`]. The
//! persisted file only ever holds tokens; plaintext exists in memory between
//! [`CredentialStore::decrypt_all`] and the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::keys::SecurityKey;
use crate::crypto::token::{CredentialCipher, TokenError};
use crate::persist::{JsonFile, PersistError};

/// Credential name to plaintext value.
pub type PlainCredentials = BTreeMap<String, String>;

/// Credential name to token text.
pub type EncryptedCredentials = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store error: {0}")]
    Persist(#[from] PersistError),
    #[error("credential {name:?} could not be decrypted: {source}")]
    InvalidToken { name: String, source: TokenError },
    #[error("credential {name:?} is not valid utf-8")]
    Utf8 { name: String },
    #[error(transparent)]
    Cipher(#[from] TokenError),
}

impl StoreError {
    /// True when the credential file has never been written.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Persist(err) if err.is_not_found())
    }

    pub fn is_invalid_token(&self) -> bool {
        matches!(self, StoreError::InvalidToken { .. })
    }
}

/// Persistent home of an encrypted credential mapping.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    file: JsonFile,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Encrypts every value of `credentials` under `key` and persists the
    /// result as the whole store.
    ///
    /// A supplied `existing` mapping is replaced, not merged: names missing
    /// from `credentials` are dropped. Callers that want a union decrypt the
    /// current store, extend it and pass the full set.
    pub fn encrypt_all(
        &self,
        credentials: &PlainCredentials,
        key: &SecurityKey,
        existing: Option<EncryptedCredentials>,
    ) -> Result<EncryptedCredentials, StoreError> {
        if let Some(existing) = existing {
            let dropped = existing
                .keys()
                .filter(|name| !credentials.contains_key(*name))
                .count();
            if dropped > 0 {
                warn!(dropped, "replacing encrypted credentials; entries not resupplied are discarded");
            }
        }

        let encrypted = encrypt_mapping(credentials, key)?;
        self.file.save(&encrypted)?;
        debug!(
            count = encrypted.len(),
            key = %key.fingerprint(),
            "stored encrypted credentials"
        );
        Ok(encrypted)
    }

    /// Adds or overwrites `additions` in the store as persisted and re-seals
    /// every entry under `key`. A missing store starts empty. The whole
    /// decrypt/merge/encrypt cycle runs under one exclusive lock, so
    /// concurrent updates never drop each other's entries.
    pub fn update(&self, key: &SecurityKey, additions: PlainCredentials) -> Result<PlainCredentials, StoreError> {
        let guard = self.file.lock_exclusive()?;
        let current: EncryptedCredentials = match guard.read() {
            Err(err) if err.is_not_found() => EncryptedCredentials::new(),
            other => other?,
        };

        let mut plain = decrypt_mapping(&current, key)?;
        plain.extend(additions);
        guard.write(&encrypt_mapping(&plain, key)?)?;
        debug!(count = plain.len(), key = %key.fingerprint(), "updated encrypted credentials");
        Ok(plain)
    }

    /// Loads the persisted tokens without decrypting them.
    pub fn load(&self) -> Result<EncryptedCredentials, StoreError> {
        Ok(self.file.load()?)
    }

    /// Loads the store and decrypts every entry with `key`. A single entry
    /// that fails verification fails the whole call.
    pub fn decrypt_all(&self, key: &SecurityKey) -> Result<PlainCredentials, StoreError> {
        let encrypted = self.load()?;
        decrypt_mapping(&encrypted, key)
    }
}

/// Decrypts an already loaded mapping, all or nothing.
pub fn decrypt_mapping(encrypted: &EncryptedCredentials, key: &SecurityKey) -> Result<PlainCredentials, StoreError> {
    let cipher = CredentialCipher::new(key)?;
    encrypted
        .iter()
        .map(|(name, token)| -> Result<(String, String), StoreError> {
            let bytes = cipher
                .decrypt(token)
                .map_err(|source| decrypt_failure(name, key, source))?;
            let value = String::from_utf8(bytes).map_err(|_| StoreError::Utf8 { name: name.clone() })?;
            Ok((name.clone(), value))
        })
        .collect()
}

/// Only integrity failures are blamed on the credential; anything else is a
/// cipher fault.
fn decrypt_failure(name: &str, key: &SecurityKey, source: TokenError) -> StoreError {
    match source {
        TokenError::InvalidToken(_) => {
            warn!(credential = %name, key = %key.fingerprint(), "credential failed verification");
            StoreError::InvalidToken {
                name: name.to_string(),
                source,
            }
        }
        other => StoreError::Cipher(other),
    }
}

fn encrypt_mapping(credentials: &PlainCredentials, key: &SecurityKey) -> Result<EncryptedCredentials, TokenError> {
    let cipher = CredentialCipher::new(key)?;
    credentials
        .iter()
        .map(|(name, value)| -> Result<(String, String), TokenError> {
            Ok((name.clone(), cipher.encrypt(value.as_bytes())?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{decrypt_failure, decrypt_mapping, CredentialStore, PlainCredentials, StoreError};
    use crate::crypto::token::TokenError;
    use crate::crypto::keys::SecurityKey;
    use crate::crypto::token;
    use std::fs;
    use tempfile::TempDir;

    fn credentials(pairs: &[(&str, &str)]) -> PlainCredentials {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn store_in(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("credentials.json"))
    }

    #[test]
    fn encrypts_every_value_and_keeps_names() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();
        let plain = credentials(&[("token", "abc123"), ("user", "octocat")]);

        let encrypted = store.encrypt_all(&plain, &key, None).expect("encrypt");
        assert_eq!(encrypted.keys().collect::<Vec<_>>(), plain.keys().collect::<Vec<_>>());
        for (name, token) in &encrypted {
            assert_ne!(token, &plain[name]);
        }

        let on_disk = fs::read_to_string(store.path()).expect("read");
        assert!(!on_disk.contains("abc123"));
        assert!(!on_disk.contains("octocat"));
    }

    #[test]
    fn decrypt_all_recovers_plaintext() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();
        let plain = credentials(&[("token", "abc123"), ("empty", ""), ("unicode", "pässwörd ✓")]);

        store.encrypt_all(&plain, &key, None).expect("encrypt");
        assert_eq!(store.decrypt_all(&key).expect("decrypt"), plain);
    }

    #[test]
    fn existing_mapping_is_replaced_not_merged() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();

        let first = store
            .encrypt_all(&credentials(&[("old", "1"), ("kept", "2")]), &key, None)
            .expect("first");
        let second = store
            .encrypt_all(&credentials(&[("kept", "3")]), &key, Some(first))
            .expect("second");

        assert_eq!(second.len(), 1);
        assert_eq!(store.load().expect("load"), second);
        assert_eq!(store.decrypt_all(&key).expect("decrypt"), credentials(&[("kept", "3")]));
    }

    #[test]
    fn one_bad_entry_fails_the_whole_store() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();
        let other = SecurityKey::generate();

        let mut encrypted = store
            .encrypt_all(&credentials(&[("a", "1"), ("b", "2")]), &key, None)
            .expect("encrypt");
        encrypted.insert("c".to_string(), token::encrypt(b"3", &other).expect("foreign token"));

        let err = decrypt_mapping(&encrypted, &key).unwrap_err();
        assert!(err.is_invalid_token());
        assert!(format!("{err}").contains("\"c\""));
    }

    #[test]
    fn wrong_key_fails_cleanly() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);

        store
            .encrypt_all(&credentials(&[("token", "abc123")]), &SecurityKey::generate(), None)
            .expect("encrypt");
        let err = store.decrypt_all(&SecurityKey::generate()).unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[test]
    fn update_merges_into_persisted_store() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();

        store.update(&key, credentials(&[("token", "abc123")])).expect("first update");
        let merged = store
            .update(&key, credentials(&[("user", "octocat"), ("token", "def456")]))
            .expect("second update");

        let expected = credentials(&[("token", "def456"), ("user", "octocat")]);
        assert_eq!(merged, expected);
        assert_eq!(store.decrypt_all(&key).expect("decrypt"), expected);
    }

    #[test]
    fn update_refuses_store_sealed_under_another_key() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        let key = SecurityKey::generate();

        store.update(&key, credentials(&[("token", "abc123")])).expect("seed");
        let err = store
            .update(&SecurityKey::generate(), credentials(&[("user", "x")]))
            .unwrap_err();
        assert!(err.is_invalid_token());
        assert_eq!(store.decrypt_all(&key).expect("untouched"), credentials(&[("token", "abc123")]));
    }

    #[test]
    fn only_integrity_failures_count_as_invalid_tokens() {
        let key = SecurityKey::generate();
        let mut encrypted = super::EncryptedCredentials::new();
        encrypted.insert("token".to_string(), "%%%".to_string());
        let err = decrypt_mapping(&encrypted, &key).unwrap_err();
        assert!(matches!(err, StoreError::InvalidToken { .. }));

        let err = decrypt_failure("token", &key, TokenError::Expired);
        assert!(!err.is_invalid_token());
        assert!(matches!(err, StoreError::Cipher(TokenError::Expired)));
    }

    #[test]
    fn missing_store_is_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        assert!(store.load().unwrap_err().is_not_found());
        assert!(store.decrypt_all(&SecurityKey::generate()).unwrap_err().is_not_found());
    }

    #[test]
    fn empty_store_file_decrypts_to_empty_mapping() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        fs::write(store.path(), "").expect("write");
        assert!(store.decrypt_all(&SecurityKey::generate()).expect("decrypt").is_empty());
    }

    #[test]
    fn non_utf8_plaintext_is_reported() {
        let key = SecurityKey::generate();
        let mut encrypted = super::EncryptedCredentials::new();
        encrypted.insert("bin".to_string(), token::encrypt(&[0xff, 0xfe], &key).expect("token"));
        let err = decrypt_mapping(&encrypted, &key).unwrap_err();
        assert!(format!("{err}").contains("utf-8"));
    }
}
