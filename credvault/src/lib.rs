//! Small credential vault: a registry of per-system symmetric keys and a store
//! that keeps named credentials encrypted at rest under one of those keys.
//!
//! Both containers are plain JSON files rewritten in full on every mutation.
//! Callers own the file locations through [`config::VaultConfig`] or by
//! constructing [`KeyRegistryStore`] and [`CredentialStore`] directly.

pub mod config;
pub mod crypto;
pub mod persist;
pub mod registry;
pub mod store;

pub use crypto::keys::SecurityKey;
pub use crypto::token::{CredentialCipher, TokenError};
pub use registry::{KeyRegistry, KeyRegistryStore, RegistryError};
pub use store::{CredentialStore, EncryptedCredentials, PlainCredentials, StoreError};
