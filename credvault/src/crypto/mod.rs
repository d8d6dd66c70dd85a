//! Cryptographic building blocks for the vault: key material, integrity
//! primitives, and the authenticated token format used for credential values.
//! Each submodule focuses on a single responsibility so the security model
//! stays simple and auditable.

pub mod integrity;
pub mod keys;
pub mod token;
