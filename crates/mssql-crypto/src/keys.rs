//! Column encryption key entries from the describe response.

use bytes::Bytes;
use parking_lot::RwLock;

/// One encrypted copy of a column encryption key.
///
/// The describe response may deliver several copies of the same key, each
/// wrapped by a different column master key, so a client can decrypt with
/// whichever key store it has access to.
#[derive(Debug, Clone)]
pub struct EncryptedKeyValue {
    /// CEK ciphertext, wrapped by the column master key.
    pub encrypted_key: Bytes,
    /// Database id the key belongs to.
    pub database_id: i32,
    /// Key id within the database.
    pub key_id: i32,
    /// Key version, advanced on rotation.
    pub key_version: i32,
    /// Opaque 8-byte metadata version.
    pub metadata_version: [u8; 8],
    /// Key-store path of the wrapping column master key.
    pub key_path: String,
    /// Name of the key store provider that can unwrap this copy.
    pub provider_name: String,
    /// Asymmetric algorithm the CEK is wrapped with (e.g. `RSA_OAEP`).
    pub algorithm_name: String,
    /// Signature of the column master key metadata, when the server sent
    /// one.
    pub signature: Option<Bytes>,
}

/// A column encryption key referenced by parameters of one command.
///
/// Keys are keyed by the ordinal the describe response assigns them; a
/// single ordinal accumulates every encrypted copy the server returned. The
/// decrypted key material is attached once a key store provider unwraps one
/// of the copies.
#[derive(Debug)]
pub struct CipherKeyEntry {
    /// Ordinal assigned by the describe response.
    pub ordinal: u16,
    /// Encrypted copies of this key, in response order.
    values: RwLock<Vec<EncryptedKeyValue>>,
    /// Whether the enclave asked for this key.
    requested_by_enclave: RwLock<bool>,
    /// Decrypted key material, once a provider unwrapped a copy.
    decrypted: RwLock<Option<Vec<u8>>>,
}

impl CipherKeyEntry {
    /// Create an empty entry for an ordinal.
    #[must_use]
    pub fn new(ordinal: u16) -> Self {
        Self {
            ordinal,
            values: RwLock::new(Vec::new()),
            requested_by_enclave: RwLock::new(false),
            decrypted: RwLock::new(None),
        }
    }

    /// Append an encrypted copy of this key.
    pub fn push_value(&self, value: EncryptedKeyValue) {
        self.values.write().push(value);
    }

    /// Snapshot of the encrypted copies.
    #[must_use]
    pub fn values(&self) -> Vec<EncryptedKeyValue> {
        self.values.read().clone()
    }

    /// Number of encrypted copies.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.read().len()
    }

    /// Mark this key as requested by the enclave.
    pub fn mark_requested_by_enclave(&self) {
        *self.requested_by_enclave.write() = true;
    }

    /// Whether the enclave asked for this key.
    #[must_use]
    pub fn is_requested_by_enclave(&self) -> bool {
        *self.requested_by_enclave.read()
    }

    /// Attach the decrypted key material.
    pub fn set_decrypted(&self, key: Vec<u8>) {
        *self.decrypted.write() = Some(key);
    }

    /// Copy of the decrypted key material, if a provider unwrapped it.
    #[must_use]
    pub fn decrypted(&self) -> Option<Vec<u8>> {
        self.decrypted.read().clone()
    }

    /// Whether the key has been unwrapped.
    #[must_use]
    pub fn is_decrypted(&self) -> bool {
        self.decrypted.read().is_some()
    }
}
