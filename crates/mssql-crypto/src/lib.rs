//! # mssql-crypto
//!
//! Column encryption support for SQL Server command execution.
//!
//! SQL Server's client-side column encryption uses a two-tier key hierarchy:
//! an externally stored column master key (CMK) wraps the symmetric column
//! encryption key (CEK) the server delivers inline with its
//! describe-parameter-encryption response. The server never sees plaintext
//! key material or plaintext cell values.
//!
//! This crate provides:
//!
//! - [`KeyStoreProvider`]: the narrow interface to external key stores that
//!   unwrap CEKs and verify CMK signatures, with global and command-local
//!   registries;
//! - [`CipherKeyEntry`] / [`CipherMetadata`]: the key and per-parameter
//!   cipher descriptors assembled from the describe response;
//! - [`CellCipher`]: the AEAD_AES_256_CBC_HMAC_SHA256 cell
//!   encryptor/decryptor;
//! - enclave collaborators: attestation parameters, enclave sessions and the
//!   key package a trusted enclave needs to evaluate predicates over
//!   encrypted columns.

pub mod aead;
pub mod cipher;
pub mod enclave;
pub mod error;
pub mod key_store;
pub mod keys;

pub use aead::CellCipher;
pub use cipher::{ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256, CipherMetadata, EncryptionType};
pub use enclave::{
    AttestationParams, EnclavePackage, EnclaveProvider, EnclaveSession, EnclaveSessionCache,
};
pub use error::CryptoError;
pub use key_store::{
    KeyStoreProvider, KeyStoreRegistry, RESERVED_PROVIDER_PREFIX, global_key_store_registry,
    resolve_provider,
};
pub use keys::{CipherKeyEntry, EncryptedKeyValue};
