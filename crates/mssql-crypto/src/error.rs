//! Column encryption error types.

use thiserror::Error;

/// Errors raised by column encryption operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The requested key store provider is not registered.
    #[error("key store provider not found: {0}")]
    ProviderNotFound(String),

    /// A custom provider used the reserved system name prefix.
    #[error("provider name {0:?} uses the reserved system prefix")]
    ReservedProviderPrefix(String),

    /// Failed to decrypt a column encryption key.
    #[error("failed to decrypt column encryption key: {0}")]
    KeyDecryptionFailed(String),

    /// The column master key signature did not verify.
    #[error("column master key signature verification failed for {key_path}")]
    SignatureVerificationFailed {
        /// Key-store path of the column master key.
        key_path: String,
    },

    /// A key had the wrong length for the cell cipher.
    #[error("column encryption key must be {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required key length.
        expected: usize,
        /// Observed key length.
        actual: usize,
    },

    /// Cell encryption failed.
    #[error("cell encryption failed: {0}")]
    EncryptionFailed(String),

    /// Cell decryption failed.
    #[error("cell decryption failed: {0}")]
    DecryptionFailed(String),

    /// The cipher algorithm id is not one this client implements.
    #[error("unsupported cipher algorithm id {0}")]
    UnsupportedAlgorithm(u8),

    /// No usable enclave session for an operation that requires one.
    #[error("no enclave session established")]
    EnclaveSessionMissing,

    /// Enclave attestation failed.
    #[error("enclave attestation failed: {0}")]
    AttestationFailed(String),

    /// Configuration error.
    #[error("encryption configuration error: {0}")]
    Configuration(String),
}

/// Result type for column encryption operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
