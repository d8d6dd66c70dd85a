//! Integrity helpers for hashing, message authentication and key derivation.
//! These stay separate from the token format so the primitives can be checked
//! against published test vectors on their own.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length in bytes of an HMAC-SHA256 tag.
pub const HMAC_SHA256_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("hkdf expansion failed: {0}")]
    HkdfFailed(String),
    #[error("hmac failed: {0}")]
    HmacFailed(String),
}

type HmacSha256 = Hmac<Sha256>;

/// Produces a raw SHA-256 digest of the provided bytes.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Returns the hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = sha256_digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generates an HMAC-SHA256 tag for the provided data.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_SHA256_LEN], IntegrityError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| IntegrityError::HmacFailed(format!("{e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Checks `tag` against the HMAC-SHA256 of `data` in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool, IntegrityError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| IntegrityError::HmacFailed(format!("{e}")))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

/// Derives key material using HKDF-SHA256, filling `okm` completely.
pub fn hkdf_expand(input_key_material: &[u8], salt: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), IntegrityError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    hk.expand(info, okm)
        .map_err(|e| IntegrityError::HkdfFailed(format!("{e}")))
}
