//! The process-wide query metadata cache.
//!
//! Maps a command fingerprint — text, parameter shape, effective encryption
//! setting, database and data source — to the cipher metadata the describe
//! round trip produced for it, so repeat executions skip the extra RPC.
//! Entries can go stale (key rotation, schema change); the server then
//! signals a client retry and the executor invalidates the entry before its
//! single retry.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use mssql_crypto::{CipherKeyEntry, CipherMetadata};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::command::ColumnEncryptionSetting;
use crate::parameter::ParameterCollection;

/// Default maximum number of cached command fingerprints.
pub const DEFAULT_MAX_ENTRIES: usize = 2000;

/// Cached cipher metadata for one parameter.
#[derive(Debug, Clone)]
pub struct CachedParamCipher {
    /// Parameter name without the `@` prefix.
    pub name: String,
    /// The cipher descriptor to stamp onto the parameter.
    pub cipher: CipherMetadata,
}

/// Cached describe results for one command fingerprint.
#[derive(Debug)]
pub struct CachedCommandMetadata {
    /// Per-parameter cipher descriptors.
    pub params: Vec<CachedParamCipher>,
    /// Keys the enclave asked for, by ordinal.
    pub keys_for_enclave: Vec<(u16, Arc<CipherKeyEntry>)>,
    /// Whether the command requires enclave computations.
    pub requires_enclave: bool,
}

/// A command fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Fingerprint a command from its identifying parts.
    #[must_use]
    pub fn compute(
        text: &str,
        setting: ColumnEncryptionSetting,
        database: &str,
        data_source: &str,
        params: &ParameterCollection,
    ) -> Self {
        let mut shape = String::new();
        params.fingerprint_into(&mut shape);

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        (setting as u8).hash(&mut hasher);
        database.hash(&mut hasher);
        data_source.hash(&mut hasher);
        shape.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// LRU cache from command fingerprint to describe results.
pub struct QueryMetadataCache {
    entries: Mutex<LruCache<CacheKey, Arc<CachedCommandMetadata>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryMetadataCache {
    /// Create a cache with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is 0.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        #[allow(clippy::expect_used)]
        let capacity = NonZeroUsize::new(max_entries).expect("cache capacity must be non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint and stamp the cached cipher metadata onto the
    /// parameters. Returns whether the lookup hit.
    ///
    /// On a hit every parameter is marked metadata-received, matching what a
    /// live describe round trip would have done.
    pub fn get_if_exists(&self, key: CacheKey, params: &mut ParameterCollection) -> bool {
        let entry = self.entries.lock().get(&key).cloned();
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(?key, "query metadata cache miss");
            return false;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(?key, "query metadata cache hit");

        for cached in &entry.params {
            if let Some(param) = params.describe_target_mut(&cached.name) {
                param.set_cipher(cached.cipher.clone());
            }
        }
        for param in params.iter_mut_internal() {
            param.mark_metadata_received();
        }
        true
    }

    /// Whether a fingerprint is currently cached, without touching LRU
    /// order or metrics.
    #[must_use]
    pub fn contains(&self, key: CacheKey) -> bool {
        self.entries.lock().peek(&key).is_some()
    }

    /// The cached entry for a fingerprint, without touching LRU order or
    /// metrics.
    #[must_use]
    pub fn peek_entry(&self, key: CacheKey) -> Option<Arc<CachedCommandMetadata>> {
        self.entries.lock().peek(&key).cloned()
    }

    /// Insert describe results for a fingerprint.
    pub fn add(&self, key: CacheKey, entry: Arc<CachedCommandMetadata>) {
        tracing::debug!(?key, params = entry.params.len(), "caching query metadata");
        self.entries.lock().put(key, entry);
    }

    /// Remove a fingerprint.
    pub fn invalidate(&self, key: CacheKey) {
        tracing::debug!(?key, "invalidating query metadata");
        self.entries.lock().pop(&key);
    }

    /// Number of cached fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for QueryMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryMetadataCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

static GLOBAL_CACHE: Lazy<QueryMetadataCache> =
    Lazy::new(|| QueryMetadataCache::new(DEFAULT_MAX_ENTRIES));

/// The process-wide query metadata cache.
#[must_use]
pub fn global_query_metadata_cache() -> &'static QueryMetadataCache {
    &GLOBAL_CACHE
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::parameter::SqlParameter;
    use mssql_crypto::{
        ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256, CipherMetadata, EncryptionType,
    };
    use tds_rpc::TdsType;

    fn sample_entry() -> Arc<CachedCommandMetadata> {
        Arc::new(CachedCommandMetadata {
            params: vec![CachedParamCipher {
                name: "ssn".to_string(),
                cipher: CipherMetadata {
                    key: Arc::new(CipherKeyEntry::new(1)),
                    algorithm_id: ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256,
                    encryption_type: EncryptionType::Deterministic,
                    normalization_rule_version: 1,
                },
            }],
            keys_for_enclave: Vec::new(),
            requires_enclave: false,
        })
    }

    fn sample_params() -> ParameterCollection {
        let mut params = ParameterCollection::new();
        params.add(SqlParameter::new("ssn", TdsType::VarChar).with_size(11));
        params
    }

    fn key_for(text: &str, params: &ParameterCollection) -> CacheKey {
        CacheKey::compute(
            text,
            ColumnEncryptionSetting::Enabled,
            "db",
            "server",
            params,
        )
    }

    #[test]
    fn test_miss_then_hit_stamps_params() {
        let cache = QueryMetadataCache::new(8);
        let mut params = sample_params();
        let key = key_for("SELECT @ssn", &params);

        assert!(!cache.get_if_exists(key, &mut params));
        assert_eq!(cache.misses(), 1);

        cache.add(key, sample_entry());
        assert!(cache.get_if_exists(key, &mut params));
        assert_eq!(cache.hits(), 1);
        assert!(params.get(0).unwrap().is_encrypted());
        assert!(params.get(0).unwrap().has_received_metadata());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = QueryMetadataCache::new(8);
        let params = sample_params();
        let key = key_for("SELECT @ssn", &params);

        cache.add(key, sample_entry());
        assert!(cache.contains(key));
        cache.invalidate(key);
        assert!(!cache.contains(key));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fingerprint_sensitive_to_text_and_shape() {
        let mut params = sample_params();
        let a = key_for("SELECT @ssn", &params);
        let b = key_for("SELECT @ssn ", &params);
        assert_ne!(a, b);

        let before = key_for("SELECT @ssn", &params);
        params.get_mut(0).unwrap().set_size(64);
        let after = key_for("SELECT @ssn", &params);
        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_sensitive_to_setting() {
        let params = sample_params();
        let enabled = CacheKey::compute(
            "SELECT 1",
            ColumnEncryptionSetting::Enabled,
            "db",
            "server",
            &params,
        );
        let disabled = CacheKey::compute(
            "SELECT 1",
            ColumnEncryptionSetting::Disabled,
            "db",
            "server",
            &params,
        );
        assert_ne!(enabled, disabled);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = QueryMetadataCache::new(2);
        let params = sample_params();
        let k1 = key_for("q1", &params);
        let k2 = key_for("q2", &params);
        let k3 = key_for("q3", &params);

        cache.add(k1, sample_entry());
        cache.add(k2, sample_entry());
        cache.add(k3, sample_entry());
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(k1));
    }
}
