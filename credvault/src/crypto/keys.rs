//! Symmetric key material bound to a single system name in the registry.

use std::fmt;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::integrity::sha256_hex;

/// Length in bytes of every key the vault generates or accepts.
pub const KEY_LEN: usize = 32;

const FINGERPRINT_HEX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key length; expected 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("base64 decoding failed: {0}")]
    Base64DecodeFailed(String),
}

/// A 32 byte symmetric key. The bytes are wiped when the value is dropped and
/// never appear in `Debug` output.
#[derive(Clone)]
pub struct SecurityKey {
    bytes: [u8; KEY_LEN],
}

impl SecurityKey {
    /// Generates a fresh key from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, KeyError> {
        if key_bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(key_bytes.len()));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key_bytes);
        Ok(Self { bytes })
    }

    /// Parses the base64 form written to the key registry file.
    pub fn from_encoded(encoded: &str) -> Result<Self, KeyError> {
        let mut decoded = STANDARD_NO_PAD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| KeyError::Base64DecodeFailed(format!("{e}")))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    pub fn to_encoded(&self) -> String {
        STANDARD_NO_PAD.encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Short SHA-256 based identifier, safe to print and log.
    pub fn fingerprint(&self) -> String {
        let mut hex = sha256_hex(&self.bytes);
        hex.truncate(FINGERPRINT_HEX_LEN);
        hex
    }
}

impl PartialEq for SecurityKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SecurityKey {}

impl fmt::Debug for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Drop for SecurityKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl Serialize for SecurityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_encoded())
    }
}

impl<'de> Deserialize<'de> for SecurityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut encoded = String::deserialize(deserializer)?;
        let key = SecurityKey::from_encoded(&encoded).map_err(serde::de::Error::custom);
        encoded.zeroize();
        key
    }
}
