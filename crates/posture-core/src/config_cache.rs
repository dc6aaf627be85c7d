//! Read-through caching over the centralized configuration store.
//!
//! # Caching policy
//!
//! - Successful lookups are cached for the life of the cache; there is no TTL
//!   and no per-key eviction.
//! - Failed lookups are never cached, so a later call can still populate the
//!   entry once the store recovers.
//! - [`ConfigCache::invalidate_all`] drops everything at once. Whoever knows
//!   configuration changed is responsible for calling it.
//!
//! The caches are plain values owned by whoever constructs them; nothing here
//! is process-global.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

// =============================================================================
// ReadThroughCache
// =============================================================================

/// Unbounded read-through cache.
///
/// Concurrent misses for the same key may both call the loader; the last
/// writer wins, which is harmless because loaders are idempotent reads.
#[derive(Debug)]
pub struct ReadThroughCache<K, V> {
    entries: tokio::sync::RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ReadThroughCache<K, V> {
    fn default() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value without loading.
    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().await.get(key).cloned()
    }

    /// Returns the cached value, or runs `load` and caches its `Ok` result.
    ///
    /// # Errors
    ///
    /// Returns the loader's error; nothing is cached in that case.
    pub async fn get_or_try_load<Q, F, Fut, E>(&self, key: &Q, load: F) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = load().await?;
        self.entries
            .write()
            .await
            .insert(key.to_owned(), value.clone());
        Ok(value)
    }

    /// Drops every cached entry.
    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// =============================================================================
// ParameterStore
// =============================================================================

/// A key/value pair from the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Full hierarchical key.
    pub name: String,
    /// Raw string value.
    pub value: String,
}

/// Configuration store errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ParameterStoreError {
    /// The store could not be reached or answered with an error.
    #[error("parameter store unavailable: {0}")]
    Unavailable(String),

    /// The store throttled the request.
    #[error("parameter store throttled the request")]
    Throttled,
}

/// Hierarchical key/value configuration store.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Looks up one key. `Ok(None)` means the key does not exist.
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, ParameterStoreError>;

    /// Returns every key below `path`, in key order.
    async fn get_parameters_by_path(&self, path: &str)
    -> Result<Vec<Parameter>, ParameterStoreError>;
}

/// In-process parameter store.
#[derive(Debug, Default)]
pub struct InMemoryParameterStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl InMemoryParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `values`.
    #[must_use]
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Sets a key.
    pub fn put(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Removes a key.
    pub fn remove(&self, name: &str) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, ParameterStoreError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    async fn get_parameters_by_path(
        &self,
        path: &str,
    ) -> Result<Vec<Parameter>, ParameterStoreError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .range(path.to_string()..)
            .take_while(|(name, _)| name.starts_with(path))
            .map(|(name, value)| Parameter {
                name: name.clone(),
                value: value.clone(),
            })
            .collect())
    }
}

// =============================================================================
// ConfigCache
// =============================================================================

enum Miss {
    NotFound,
    Failed(ParameterStoreError),
}

/// Read-through cache over a [`ParameterStore`].
pub struct ConfigCache {
    store: Arc<dyn ParameterStore>,
    values: ReadThroughCache<String, String>,
    prefixes: ReadThroughCache<String, Vec<Parameter>>,
}

impl ConfigCache {
    /// Creates an empty cache in front of `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ParameterStore>) -> Self {
        Self {
            store,
            values: ReadThroughCache::new(),
            prefixes: ReadThroughCache::new(),
        }
    }

    /// Returns the value for `key`, or `None` when it does not exist or the
    /// store failed. Neither outcome is cached.
    pub async fn get(&self, key: &str) -> Option<String> {
        let loaded = self
            .values
            .get_or_try_load(key, || async {
                match self.store.get_parameter(key).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(Miss::NotFound),
                    Err(e) => Err(Miss::Failed(e)),
                }
            })
            .await;
        match loaded {
            Ok(value) => Some(value),
            Err(Miss::NotFound) => {
                debug!(key = %key, "configuration key not found");
                None
            },
            Err(Miss::Failed(e)) => {
                warn!(key = %key, error = %e, "configuration lookup failed");
                None
            },
        }
    }

    /// Returns every key below `prefix`.
    ///
    /// An empty result is a valid answer and is cached like any other.
    ///
    /// # Errors
    ///
    /// Returns the store error; it is not cached.
    pub async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<Parameter>, ParameterStoreError> {
        self.prefixes
            .get_or_try_load(prefix, || self.store.get_parameters_by_path(prefix))
            .await
    }

    /// Drops every cached value and prefix listing.
    pub async fn invalidate_all(&self) {
        self.values.invalidate_all().await;
        self.prefixes.invalidate_all().await;
        debug!("configuration cache invalidated");
    }
}

impl std::fmt::Debug for ConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCache").finish_non_exhaustive()
    }
}
