//! Authenticated token format for individual credential values.
//!
//! A token is `version || timestamp || nonce || ciphertext || tag`:
//! the value is sealed with ChaCha20-Poly1305 (header bound as associated
//! data) and the whole token is then covered by an HMAC-SHA256 tag. Both
//! sub-keys come from the caller's [`SecurityKey`] through HKDF, so a token can
//! be checked and opened with nothing but that key. The text form is URL-safe
//! base64 without padding so tokens can sit in JSON or YAML untouched.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroize;

use crate::crypto::integrity::{hkdf_expand, hmac_sha256, verify_hmac_sha256, IntegrityError, HMAC_SHA256_LEN};
use crate::crypto::keys::{SecurityKey, KEY_LEN};

/// Leading byte of every token this module produces.
pub const TOKEN_VERSION: u8 = 0x81;

const TIMESTAMP_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + TIMESTAMP_LEN + NONCE_LEN;
const MIN_TOKEN_LEN: usize = HEADER_LEN + AEAD_TAG_LEN + HMAC_SHA256_LEN;

/// Tokens stamped further than this into the future are rejected by TTL checks.
const MAX_CLOCK_SKEW_SECS: u64 = 60;

const HKDF_SALT: &[u8] = b"credvault-token-v1";
const ENCRYPTION_INFO: &[u8] = b"credvault encryption";
const AUTHENTICATION_INFO: &[u8] = b"credvault authentication";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    InvalidToken(&'static str),
    #[error("token expired")]
    Expired,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("key derivation failed: {0}")]
    Derivation(#[from] IntegrityError),
}

impl TokenError {
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, TokenError::InvalidToken(_))
    }
}

/// Seals and opens credential tokens under one [`SecurityKey`].
pub struct CredentialCipher {
    encryption_key: [u8; KEY_LEN],
    authentication_key: [u8; KEY_LEN],
}

impl CredentialCipher {
    pub fn new(key: &SecurityKey) -> Result<Self, TokenError> {
        let mut encryption_key = [0u8; KEY_LEN];
        let mut authentication_key = [0u8; KEY_LEN];
        hkdf_expand(key.as_bytes(), HKDF_SALT, ENCRYPTION_INFO, &mut encryption_key)?;
        hkdf_expand(key.as_bytes(), HKDF_SALT, AUTHENTICATION_INFO, &mut authentication_key)?;
        Ok(Self {
            encryption_key,
            authentication_key,
        })
    }

    /// Encrypts `value` into the text form of a token.
    pub fn encrypt(&self, value: &[u8]) -> Result<String, TokenError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt_raw(value)?))
    }

    /// Verifies and decrypts the text form of a token.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, TokenError> {
        self.decrypt_raw(&decode_text(token)?)
    }

    /// Like [`decrypt`](Self::decrypt), but also rejects tokens created more
    /// than `ttl` ago or stamped implausibly far in the future.
    pub fn decrypt_with_ttl(&self, token: &str, ttl: Duration) -> Result<Vec<u8>, TokenError> {
        let raw = decode_text(token)?;
        let timestamp = self.verify(&raw)?;
        check_age(timestamp, unix_now(), ttl)?;
        self.open_verified(&raw)
    }

    /// Returns the creation time embedded in an authentic token, in seconds
    /// since the Unix epoch.
    pub fn token_timestamp(&self, token: &str) -> Result<u64, TokenError> {
        self.verify(&decode_text(token)?)
    }

    /// Binary form of [`encrypt`](Self::encrypt).
    pub fn encrypt_raw(&self, value: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.encrypt_at(value, unix_now())
    }

    /// Binary form of [`decrypt`](Self::decrypt).
    pub fn decrypt_raw(&self, token: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.verify(token)?;
        self.open_verified(token)
    }

    fn encrypt_at(&self, value: &[u8], timestamp: u64) -> Result<Vec<u8>, TokenError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut token = Vec::with_capacity(MIN_TOKEN_LEN + value.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.encryption_key));
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: value, aad: &token[..HEADER_LEN] })
            .map_err(|e| TokenError::EncryptionFailed(format!("{e}")))?;
        token.extend_from_slice(&ciphertext);

        let tag = hmac_sha256(&self.authentication_key, &token)?;
        token.extend_from_slice(&tag);
        Ok(token)
    }

    /// Checks structure and tag, returning the embedded timestamp.
    fn verify(&self, token: &[u8]) -> Result<u64, TokenError> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(TokenError::InvalidToken("token too short"));
        }
        if token[0] != TOKEN_VERSION {
            return Err(TokenError::InvalidToken("unsupported version marker"));
        }

        let (body, tag) = token.split_at(token.len() - HMAC_SHA256_LEN);
        if !verify_hmac_sha256(&self.authentication_key, body, tag)? {
            warn!("token integrity check failed");
            return Err(TokenError::InvalidToken("integrity check failed"));
        }

        let mut timestamp = [0u8; TIMESTAMP_LEN];
        timestamp.copy_from_slice(&token[1..1 + TIMESTAMP_LEN]);
        Ok(u64::from_be_bytes(timestamp))
    }

    /// Decrypts a token that already passed [`verify`](Self::verify).
    fn open_verified(&self, token: &[u8]) -> Result<Vec<u8>, TokenError> {
        let body = &token[..token.len() - HMAC_SHA256_LEN];
        let (header, ciphertext) = body.split_at(HEADER_LEN);
        let nonce = Nonce::from_slice(&header[1 + TIMESTAMP_LEN..]);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.encryption_key));
        cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: header })
            .map_err(|_| TokenError::InvalidToken("ciphertext rejected"))
    }
}

impl Drop for CredentialCipher {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.authentication_key.zeroize();
    }
}

/// Encrypts a single value under `key`.
pub fn encrypt(value: &[u8], key: &SecurityKey) -> Result<String, TokenError> {
    CredentialCipher::new(key)?.encrypt(value)
}

/// Verifies and decrypts a single token under `key`.
pub fn decrypt(token: &str, key: &SecurityKey) -> Result<Vec<u8>, TokenError> {
    CredentialCipher::new(key)?.decrypt(token)
}

fn decode_text(token: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(token.trim().as_bytes())
        .map_err(|_| TokenError::InvalidToken("token is not valid base64"))
}

fn check_age(timestamp: u64, now: u64, ttl: Duration) -> Result<(), TokenError> {
    if timestamp > now.saturating_add(MAX_CLOCK_SKEW_SECS) {
        return Err(TokenError::InvalidToken("timestamp is in the future"));
    }
    if timestamp.saturating_add(ttl.as_secs()) < now {
        return Err(TokenError::Expired);
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher_with(byte: u8) -> CredentialCipher {
        let key = SecurityKey::from_bytes(&[byte; KEY_LEN]).expect("key should be valid");
        CredentialCipher::new(&key).expect("cipher should build")
    }

    #[test]
    fn encrypts_and_decrypts_round_trip() {
        let key = SecurityKey::generate();
        let token = encrypt(b"secret-token", &key).expect("encryption should succeed");
        let plaintext = decrypt(&token, &key).expect("decryption should succeed");
        assert_eq!(plaintext, b"secret-token");
    }

    #[test]
    fn round_trips_empty_value() {
        let cipher = cipher_with(1);
        let token = cipher.encrypt(b"").expect("encryption should succeed");
        assert_eq!(cipher.decrypt(&token).expect("decryption should succeed"), b"");
    }

    #[test]
    fn same_value_yields_different_tokens() {
        let cipher = cipher_with(2);
        let a = cipher.encrypt(b"abc123").expect("encrypt");
        let b = cipher.encrypt(b"abc123").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn token_layout_is_self_describing() {
        let cipher = cipher_with(3);
        let raw = cipher.encrypt_at(b"hello", 1_700_000_000).expect("encrypt");
        assert_eq!(raw[0], TOKEN_VERSION);
        assert_eq!(&raw[1..9], &1_700_000_000u64.to_be_bytes());
        assert_eq!(raw.len(), MIN_TOKEN_LEN + b"hello".len());

        let text = URL_SAFE_NO_PAD.encode(&raw);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(cipher.token_timestamp(&text).expect("timestamp"), 1_700_000_000);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = cipher_with(4).encrypt(b"payload").expect("encrypt");
        let err = cipher_with(5).decrypt(&token).unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let cipher = cipher_with(6);
        let raw = cipher.encrypt_raw(b"abc123").expect("encrypt");
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut tampered = raw.clone();
                tampered[byte] ^= 1 << bit;
                let err = cipher.decrypt_raw(&tampered).unwrap_err();
                assert!(err.is_invalid_token(), "bit {bit} of byte {byte} went unnoticed");
            }
        }
    }

    #[test]
    fn rejects_malformed_tokens() {
        let cipher = cipher_with(7);
        let raw = cipher.encrypt_raw(b"payload").expect("encrypt");

        let truncated = &raw[..MIN_TOKEN_LEN - 1];
        assert!(cipher.decrypt_raw(truncated).unwrap_err().is_invalid_token());

        let mut shortened = raw.clone();
        shortened.pop();
        assert!(cipher.decrypt_raw(&shortened).unwrap_err().is_invalid_token());

        let mut wrong_version = raw.clone();
        wrong_version[0] = 0x80;
        let err = cipher.decrypt_raw(&wrong_version).unwrap_err();
        assert!(format!("{err}").contains("version"));

        assert!(cipher.decrypt("***not-a-token***").unwrap_err().is_invalid_token());
        assert!(cipher.decrypt("").unwrap_err().is_invalid_token());
    }

    #[test]
    fn ttl_rejects_old_tokens() {
        let cipher = cipher_with(8);
        let old = URL_SAFE_NO_PAD.encode(cipher.encrypt_at(b"v", unix_now() - 3_600).expect("encrypt"));
        assert!(matches!(
            cipher.decrypt_with_ttl(&old, Duration::from_secs(60)),
            Err(TokenError::Expired)
        ));
        assert_eq!(cipher.decrypt_with_ttl(&old, Duration::from_secs(7_200)).expect("fresh enough"), b"v");
        assert_eq!(cipher.decrypt(&old).expect("no ttl"), b"v");
    }

    #[test]
    fn ttl_rejects_future_tokens() {
        let cipher = cipher_with(9);
        let future = URL_SAFE_NO_PAD.encode(cipher.encrypt_at(b"v", unix_now() + 3_600).expect("encrypt"));
        let err = cipher.decrypt_with_ttl(&future, Duration::from_secs(60)).unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[test]
    fn ttl_checks_integrity_before_age() {
        let token = cipher_with(10).encrypt(b"v").expect("encrypt");
        let err = cipher_with(11)
            .decrypt_with_ttl(&token, Duration::from_secs(60))
            .unwrap_err();
        assert!(err.is_invalid_token());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn decrypt_inverts_encrypt(value in proptest::collection::vec(any::<u8>(), 0..256), k in any::<[u8; 32]>()) {
            let key = SecurityKey::from_bytes(&k).expect("key should be valid");
            let token = encrypt(&value, &key).expect("encrypt");
            prop_assert_eq!(decrypt(&token, &key).expect("decrypt"), value);
        }

        #[test]
        fn other_keys_never_decrypt(value in proptest::collection::vec(any::<u8>(), 0..64), k1 in any::<[u8; 32]>(), k2 in any::<[u8; 32]>()) {
            prop_assume!(k1 != k2);
            let key1 = SecurityKey::from_bytes(&k1).expect("key should be valid");
            let key2 = SecurityKey::from_bytes(&k2).expect("key should be valid");
            let token = encrypt(&value, &key1).expect("encrypt");
            prop_assert!(decrypt(&token, &key2).unwrap_err().is_invalid_token());
        }
    }
}
