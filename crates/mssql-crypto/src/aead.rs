//! AEAD_AES_256_CBC_HMAC_SHA256 cell encryption.
//!
//! Encrypt-then-MAC over AES-256-CBC with HMAC-SHA256, the scheme the
//! protocol mandates for encrypted cells. Three sub-keys are derived from
//! the column encryption key with fixed labels; the ciphertext layout is
//!
//! ```text
//! version(1) | mac(32) | iv(16) | aes_cbc_ciphertext(16n)
//! ```
//!
//! Deterministic encryption derives the IV from the plaintext so equal
//! plaintexts produce equal ciphertexts; randomized encryption draws a fresh
//! IV per cell.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::cipher::EncryptionType;
use crate::error::CryptoError;

const FORMAT_VERSION: u8 = 0x01;
const KEY_SIZE: usize = 32;
const BLOCK_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const MIN_CIPHERTEXT: usize = 1 + MAC_SIZE + IV_SIZE + BLOCK_SIZE;

// Derivation labels fixed by the algorithm definition.
const LABEL_ENCRYPTION: &[u8] = b"Microsoft SQL Server cell encryption key";
const LABEL_MAC: &[u8] = b"Microsoft SQL Server cell MAC key";
const LABEL_IV: &[u8] = b"Microsoft SQL Server cell IV key";
const ALGORITHM_LABEL: &[u8] = b"AEAD_AES_256_CBC_HMAC_SHA_256";

type HmacSha256 = Hmac<Sha256>;
type CbcEncryptor = cbc::Encryptor<aes::Aes256>;
type CbcDecryptor = cbc::Decryptor<aes::Aes256>;

/// Cell encryptor/decryptor bound to one column encryption key.
pub struct CellCipher {
    encryption_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
    iv_key: [u8; KEY_SIZE],
}

impl CellCipher {
    /// Derive the cell cipher from a 32-byte column encryption key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeySize`] for keys of any other length.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let key_bits = (key.len() as u16 * 8).to_le_bytes();
        Ok(Self {
            encryption_key: subkey(key, LABEL_ENCRYPTION, &key_bits)?,
            mac_key: subkey(key, LABEL_MAC, &key_bits)?,
            iv_key: subkey(key, LABEL_IV, &key_bits)?,
        })
    }

    /// Encrypt one cell value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] when the cipher cannot be
    /// initialized, and [`CryptoError::Configuration`] for
    /// [`EncryptionType::PlainText`].
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        encryption_type: EncryptionType,
    ) -> Result<Vec<u8>, CryptoError> {
        let iv = match encryption_type {
            EncryptionType::PlainText => {
                return Err(CryptoError::Configuration(
                    "cannot encrypt with the plaintext encryption type".into(),
                ));
            }
            EncryptionType::Randomized => {
                let mut iv = [0u8; IV_SIZE];
                rand::rng().fill_bytes(&mut iv);
                iv
            }
            EncryptionType::Deterministic => self.derive_iv(plaintext)?,
        };

        let padded = plaintext.len() - plaintext.len() % BLOCK_SIZE + BLOCK_SIZE;
        let mut buf = vec![0u8; padded];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let cipher = CbcEncryptor::new_from_slices(&self.encryption_key, &iv)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mac = self.authenticate(&iv, ciphertext)?;

        let mut out = Vec::with_capacity(1 + MAC_SIZE + IV_SIZE + ciphertext.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&iv);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }

    /// Decrypt one cell value, verifying the MAC first.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on truncated input, a
    /// version mismatch, a MAC mismatch, or bad padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_CIPHERTEXT {
            return Err(CryptoError::DecryptionFailed(format!(
                "ciphertext is {} bytes, minimum is {MIN_CIPHERTEXT}",
                ciphertext.len()
            )));
        }
        if ciphertext[0] != FORMAT_VERSION {
            return Err(CryptoError::DecryptionFailed(format!(
                "unexpected format version {:#04x}",
                ciphertext[0]
            )));
        }

        let mac = &ciphertext[1..1 + MAC_SIZE];
        let iv = &ciphertext[1 + MAC_SIZE..1 + MAC_SIZE + IV_SIZE];
        let payload = &ciphertext[1 + MAC_SIZE + IV_SIZE..];
        if payload.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::DecryptionFailed(
                "ciphertext payload is not block-aligned".into(),
            ));
        }

        let expected = self.authenticate(iv, payload)?;
        if !ct_eq(mac, &expected) {
            return Err(CryptoError::DecryptionFailed(
                "authentication tag mismatch".into(),
            ));
        }

        let cipher = CbcDecryptor::new_from_slices(&self.encryption_key, iv)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        let mut buf = payload.to_vec();
        let plaintext = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        Ok(plaintext.to_vec())
    }

    /// Deterministic IV: truncated HMAC of the plaintext under the IV key.
    fn derive_iv(&self, plaintext: &[u8]) -> Result<[u8; IV_SIZE], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.iv_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&digest[..IV_SIZE]);
        Ok(iv)
    }

    /// MAC over version byte, IV, ciphertext and version length.
    fn authenticate(&self, iv: &[u8], payload: &[u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        mac.update(&[FORMAT_VERSION]);
        mac.update(iv);
        mac.update(payload);
        mac.update(&[1u8]);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}

impl Drop for CellCipher {
    fn drop(&mut self) {
        self.encryption_key.fill(0);
        self.mac_key.fill(0);
        self.iv_key.fill(0);
    }
}

fn subkey(key: &[u8], label: &[u8], key_bits: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::Configuration(e.to_string()))?;
    mac.update(label);
    mac.update(ALGORITHM_LABEL);
    mac.update(key_bits);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Constant-time slice comparison.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cipher() -> CellCipher {
        let key: Vec<u8> = (0u8..32).collect();
        CellCipher::new(&key).unwrap()
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            CellCipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeySize {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_roundtrip_randomized() {
        let cipher = cipher();
        let plaintext = b"sensitive cell value";
        let ct = cipher.encrypt(plaintext, EncryptionType::Randomized).unwrap();
        assert!(ct.len() >= MIN_CIPHERTEXT);
        assert_eq!(ct[0], FORMAT_VERSION);
        assert_eq!(cipher.decrypt(&ct).unwrap(), plaintext);
    }

    #[test]
    fn test_deterministic_is_stable() {
        let cipher = cipher();
        let a = cipher.encrypt(b"abc", EncryptionType::Deterministic).unwrap();
        let b = cipher.encrypt(b"abc", EncryptionType::Deterministic).unwrap();
        assert_eq!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"abc");
    }

    #[test]
    fn test_randomized_differs_per_call() {
        let cipher = cipher();
        let a = cipher.encrypt(b"abc", EncryptionType::Randomized).unwrap();
        let b = cipher.encrypt(b"abc", EncryptionType::Randomized).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_plaintext_type_is_rejected() {
        let cipher = cipher();
        assert!(cipher.encrypt(b"abc", EncryptionType::PlainText).is_err());
    }

    #[test]
    fn test_tampering_is_detected() {
        let cipher = cipher();
        let mut ct = cipher
            .encrypt(b"payload", EncryptionType::Randomized)
            .unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&ct),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let cipher = cipher();
        let mut ct = cipher.encrypt(b"v", EncryptionType::Randomized).unwrap();
        ct[0] = 0x02;
        assert!(cipher.decrypt(&ct).is_err());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let cipher = cipher();
        assert!(cipher.decrypt(&[FORMAT_VERSION; 12]).is_err());
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let cipher = cipher();
        let ct = cipher.encrypt(b"", EncryptionType::Deterministic).unwrap();
        assert!(cipher.decrypt(&ct).unwrap().is_empty());
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"sama"));
        assert!(!ct_eq(b"same", b"longer"));
    }
}
