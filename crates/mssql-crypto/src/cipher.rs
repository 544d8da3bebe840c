//! Per-parameter cipher descriptors.

use std::sync::Arc;

use crate::error::CryptoError;
use crate::keys::CipherKeyEntry;

/// Cipher algorithm id for AEAD_AES_256_CBC_HMAC_SHA256, the only algorithm
/// the protocol defines for client-side column encryption today.
pub const ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256: u8 = 2;

/// How a column (or parameter) is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionType {
    /// Not encrypted; the value travels in the clear.
    PlainText = 0,
    /// Deterministic encryption: same plaintext, same ciphertext. Supports
    /// equality predicates at the cost of revealing data patterns.
    Deterministic = 1,
    /// Randomized encryption: same plaintext, different ciphertext each
    /// time. No server-side comparisons are possible.
    Randomized = 2,
}

impl EncryptionType {
    /// Parse the wire byte from the describe response.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Configuration`] for bytes outside the protocol
    /// range.
    pub fn from_wire(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(Self::PlainText),
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Randomized),
            other => Err(CryptoError::Configuration(format!(
                "unknown encryption type byte {other}"
            ))),
        }
    }

    /// Algorithm name as spelled in server metadata.
    #[must_use]
    pub fn algorithm_name(self) -> &'static str {
        match self {
            Self::PlainText => "PLAINTEXT",
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_256_DETERMINISTIC",
            Self::Randomized => "AEAD_AES_256_CBC_HMAC_SHA_256_RANDOMIZED",
        }
    }
}

/// Cipher descriptor attached to a parameter after the describe round trip.
#[derive(Debug, Clone)]
pub struct CipherMetadata {
    /// The column encryption key this parameter is protected with.
    pub key: Arc<CipherKeyEntry>,
    /// Cipher algorithm id (see
    /// [`ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256`]).
    pub algorithm_id: u8,
    /// Deterministic or randomized encryption.
    pub encryption_type: EncryptionType,
    /// Version of the type normalization applied before encryption.
    pub normalization_rule_version: u8,
}

impl CipherMetadata {
    /// Whether the descriptor calls for actual encryption.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption_type != EncryptionType::PlainText
    }

    /// Validate the algorithm id against what this client implements.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for anything other than
    /// AEAD_AES_256_CBC_HMAC_SHA256.
    pub fn require_supported_algorithm(&self) -> Result<(), CryptoError> {
        if self.algorithm_id == ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256 {
            Ok(())
        } else {
            Err(CryptoError::UnsupportedAlgorithm(self.algorithm_id))
        }
    }
}
