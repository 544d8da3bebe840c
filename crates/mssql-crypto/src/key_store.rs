//! Key store providers and provider registries.
//!
//! A key store provider fronts whatever holds the column master key — a key
//! vault, a certificate store, an HSM. The engine only ever asks it to
//! unwrap a column encryption key or to verify a column master key
//! signature; key material never flows the other way.
//!
//! Providers register either in the process-wide registry or in a
//! command-local one that shadows it. Custom registrations must not use the
//! reserved system prefix.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::CryptoError;

/// Name prefix reserved for system key store providers (case-insensitive).
pub const RESERVED_PROVIDER_PREFIX: &str = "MSSQL_";

/// Narrow interface to an external key store.
#[async_trait::async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// Provider name as spelled in server metadata (e.g.
    /// `AZURE_KEY_VAULT`).
    fn provider_name(&self) -> &str;

    /// Unwrap a column encryption key with the column master key at
    /// `key_path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the key cannot be found or unwrapping fails.
    async fn decrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify the signature over the column master key metadata.
    ///
    /// `allow_enclave_computations` is part of the signed payload: a key
    /// signed without it must not be released to an enclave.
    ///
    /// # Errors
    ///
    /// Returns an error when the key store cannot perform the check.
    async fn verify_column_master_key_signature(
        &self,
        key_path: &str,
        allow_enclave_computations: bool,
        signature: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// A named set of key store providers.
pub struct KeyStoreRegistry {
    providers: RwLock<HashMap<String, Arc<dyn KeyStoreProvider>>>,
    /// Whether this registry accepts reserved-prefix names (the global
    /// registry does; command-local ones do not).
    system: bool,
}

impl KeyStoreRegistry {
    /// Create the process-wide registry. System provider names are allowed.
    #[must_use]
    pub fn system() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            system: true,
        }
    }

    /// Create a command-local registry that shadows the global one.
    #[must_use]
    pub fn custom() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            system: false,
        }
    }

    /// Register a provider under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ReservedProviderPrefix`] when a custom
    /// registry is handed a provider whose name starts with the reserved
    /// system prefix, compared case-insensitively.
    pub fn register(&self, provider: Arc<dyn KeyStoreProvider>) -> Result<(), CryptoError> {
        let name = provider.provider_name().to_string();
        let prefix = RESERVED_PROVIDER_PREFIX.as_bytes();
        if !self.system
            && name.len() >= prefix.len()
            && name.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            return Err(CryptoError::ReservedProviderPrefix(name));
        }
        tracing::debug!(provider = %name, "registering key store provider");
        self.providers.write().insert(name, provider);
        Ok(())
    }

    /// Look up a provider by name.
    #[must_use]
    pub fn try_get(&self, name: &str) -> Option<Arc<dyn KeyStoreProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

impl std::fmt::Debug for KeyStoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreRegistry")
            .field("system", &self.system)
            .field(
                "providers",
                &self.providers.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

static GLOBAL_REGISTRY: Lazy<KeyStoreRegistry> = Lazy::new(KeyStoreRegistry::system);

/// The process-wide key store registry.
///
/// A command-local registry, when present, shadows this one: lookups consult
/// the local registry first and fall back here.
#[must_use]
pub fn global_key_store_registry() -> &'static KeyStoreRegistry {
    &GLOBAL_REGISTRY
}

/// Resolve a provider name against a local registry, falling back to the
/// global one.
#[must_use]
pub fn resolve_provider(
    local: Option<&KeyStoreRegistry>,
    name: &str,
) -> Option<Arc<dyn KeyStoreProvider>> {
    if let Some(local) = local {
        if let Some(provider) = local.try_get(name) {
            return Some(provider);
        }
    }
    global_key_store_registry().try_get(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct NamedProvider(&'static str);

    #[async_trait::async_trait]
    impl KeyStoreProvider for NamedProvider {
        fn provider_name(&self) -> &str {
            self.0
        }

        async fn decrypt_column_encryption_key(
            &self,
            _key_path: &str,
            _algorithm: &str,
            encrypted_key: &[u8],
        ) -> Result<Vec<u8>, CryptoError> {
            Ok(encrypted_key.to_vec())
        }

        async fn verify_column_master_key_signature(
            &self,
            _key_path: &str,
            _allow_enclave_computations: bool,
            _signature: &[u8],
        ) -> Result<bool, CryptoError> {
            Ok(true)
        }
    }

    #[test]
    fn test_custom_registry_rejects_reserved_prefix() {
        let registry = KeyStoreRegistry::custom();
        let err = registry
            .register(Arc::new(NamedProvider("MSSQL_CERTIFICATE_STORE")))
            .unwrap_err();
        assert!(matches!(err, CryptoError::ReservedProviderPrefix(_)));

        // The check is case-insensitive.
        let err = registry
            .register(Arc::new(NamedProvider("mssql_custom")))
            .unwrap_err();
        assert!(matches!(err, CryptoError::ReservedProviderPrefix(_)));
    }

    #[test]
    fn test_system_registry_accepts_reserved_prefix() {
        let registry = KeyStoreRegistry::system();
        registry
            .register(Arc::new(NamedProvider("MSSQL_CERTIFICATE_STORE")))
            .unwrap();
        assert!(registry.try_get("MSSQL_CERTIFICATE_STORE").is_some());
    }

    #[test]
    fn test_custom_registry_accepts_other_names() {
        let registry = KeyStoreRegistry::custom();
        registry
            .register(Arc::new(NamedProvider("MY_VAULT")))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.try_get("MY_VAULT").is_some());
        assert!(registry.try_get("OTHER").is_none());
    }

    #[test]
    fn test_local_registry_shadows_global() {
        let local = KeyStoreRegistry::custom();
        local.register(Arc::new(NamedProvider("SHADOWED"))).unwrap();
        let resolved = resolve_provider(Some(&local), "SHADOWED").unwrap();
        assert_eq!(resolved.provider_name(), "SHADOWED");
        assert!(resolve_provider(Some(&local), "NOWHERE").is_none());
    }
}
