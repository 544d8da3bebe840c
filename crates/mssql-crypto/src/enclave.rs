//! Enclave attestation collaborators.
//!
//! Servers can host a trusted enclave that evaluates predicates over
//! encrypted columns. Before any key material is released to it, the client
//! attests the enclave's identity: it sends attestation parameters with the
//! describe round trip, receives attestation evidence back, and derives an
//! enclave session from it. Keys the enclave asked for are then wrapped into
//! an enclave package transmitted with the real request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::error::CryptoError;
use crate::keys::CipherKeyEntry;

/// Client-side attestation parameters sent with the describe round trip.
#[derive(Debug, Clone)]
pub struct AttestationParams {
    /// Attestation protocol identifier.
    pub protocol: u8,
    /// Attestation service URL.
    pub url: String,
    /// Protocol-specific payload (e.g. a client nonce or key share).
    pub payload: Bytes,
}

/// An established enclave session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveSession {
    /// Server-assigned session id.
    pub session_id: u64,
    /// Negotiated session key material.
    pub session_key: Bytes,
}

/// The key package a trusted enclave needs for one request.
#[derive(Debug, Clone)]
pub struct EnclavePackage {
    /// Opaque package payload the wire layer transmits verbatim.
    pub payload: Bytes,
}

/// Collaborator that implements one attestation protocol.
#[async_trait::async_trait]
pub trait EnclaveProvider: Send + Sync {
    /// Produce attestation parameters for a session handshake.
    ///
    /// # Errors
    ///
    /// Returns an error when the attestation service cannot be reached or
    /// rejects the request.
    async fn get_attestation_parameters(
        &self,
        protocol: u8,
        url: &str,
    ) -> Result<AttestationParams, CryptoError>;

    /// Serialize attestation parameters into the wire blob carried by the
    /// describe request.
    fn serialize_attestation_parameters(&self, params: &AttestationParams) -> Bytes;

    /// Derive an enclave session from the attestation evidence the server
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error when the evidence does not verify.
    async fn create_session(
        &self,
        params: &AttestationParams,
        attestation_info: &[u8],
    ) -> Result<EnclaveSession, CryptoError>;

    /// Drop a session after the server reported its handle invalid.
    fn invalidate_session(&self, url: &str, session: &EnclaveSession);

    /// Wrap the keys the enclave asked for into a package for one request.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EnclaveSessionMissing`]-class errors when no
    /// session key is available or a key is still wrapped.
    fn generate_enclave_package(
        &self,
        keys: &[Arc<CipherKeyEntry>],
        text: &str,
        session: &EnclaveSession,
    ) -> Result<EnclavePackage, CryptoError> {
        // Default layout: session id, per-key (ordinal, len, key), then the
        // UTF-16 length of the statement the package belongs to.
        let mut buf = BytesMut::new();
        buf.put_u64_le(session.session_id);
        buf.put_u16_le(keys.len() as u16);
        for key in keys {
            let material = key.decrypted().ok_or(CryptoError::EnclaveSessionMissing)?;
            buf.put_u16_le(key.ordinal);
            buf.put_u16_le(material.len() as u16);
            buf.put_slice(&material);
        }
        buf.put_u32_le(text.encode_utf16().count() as u32 * 2);
        Ok(EnclavePackage {
            payload: buf.freeze(),
        })
    }
}

/// Process-wide cache of enclave sessions, keyed by attestation URL.
///
/// Sessions survive across commands on the same connection; an invalid
/// session handle reported by the server removes the entry before the
/// execution retries.
pub struct EnclaveSessionCache {
    sessions: RwLock<HashMap<String, Arc<EnclaveSession>>>,
}

impl EnclaveSessionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the session for an attestation URL.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Arc<EnclaveSession>> {
        self.sessions.read().get(url).cloned()
    }

    /// Store the session for an attestation URL.
    pub fn insert(&self, url: &str, session: EnclaveSession) -> Arc<EnclaveSession> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .insert(url.to_string(), Arc::clone(&session));
        session
    }

    /// Remove the session for an attestation URL.
    pub fn invalidate(&self, url: &str) -> Option<Arc<EnclaveSession>> {
        tracing::debug!(url, "invalidating enclave session");
        self.sessions.write().remove(url)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for EnclaveSessionCache {
    fn default() -> Self {
        Self::new()
    }
}
