//! Account hierarchy lookups with a process-lifetime cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config_cache::ReadThroughCache;

/// Directory service errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// The account is not part of the hierarchy.
    #[error("account {account_id} not found in directory")]
    AccountNotFound {
        /// The account that was looked up.
        account_id: String,
    },

    /// The directory could not be reached.
    #[error("directory service unavailable: {0}")]
    Unavailable(String),
}

/// Account directory (organizational hierarchy) service.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Returns the immediate parent group ids of `account_id`.
    async fn list_parents(&self, account_id: &str) -> Result<Vec<String>, DirectoryError>;
}

/// Directory backed by a fixed map.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    parents: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryAccountDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `account_id` with the given parents.
    pub fn insert(&self, account_id: impl Into<String>, parents: Vec<String>) {
        self.parents
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(account_id.into(), parents);
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn list_parents(&self, account_id: &str) -> Result<Vec<String>, DirectoryError> {
        self.parents
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(account_id)
            .cloned()
            .ok_or_else(|| DirectoryError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }
}

/// Resolves accounts to parent groups, caching results per account.
pub struct HierarchyResolver {
    directory: Arc<dyn AccountDirectory>,
    cache: ReadThroughCache<String, Vec<String>>,
}

impl HierarchyResolver {
    /// Creates a resolver with an empty cache.
    #[must_use]
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            directory,
            cache: ReadThroughCache::new(),
        }
    }

    /// Returns the parent groups of `account_id`.
    ///
    /// Accounts outside the hierarchy resolve to no parents and are cached
    /// as such.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] (uncached) when the directory
    /// fails.
    pub async fn parents(&self, account_id: &str) -> Result<Vec<String>, DirectoryError> {
        self.cache
            .get_or_try_load(account_id, || async {
                match self.directory.list_parents(account_id).await {
                    Err(DirectoryError::AccountNotFound { .. }) => {
                        debug!(account_id = %account_id, "account outside hierarchy");
                        Ok(Vec::new())
                    },
                    other => other,
                }
            })
            .await
    }

    /// Like [`parents`](Self::parents) but treats lookup failures as "no
    /// parent groups", which lets the hierarchy filter pass.
    pub async fn parents_or_empty(&self, account_id: &str) -> Vec<String> {
        match self.parents(account_id).await {
            Ok(parents) => parents,
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    error = %e,
                    "hierarchy lookup failed, assuming no parents"
                );
                Vec::new()
            },
        }
    }

    /// Drops every cached account.
    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all().await;
    }

    /// Number of cached accounts.
    pub async fn cached_accounts(&self) -> usize {
        self.cache.len().await
    }
}

impl std::fmt::Debug for HierarchyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingDirectory {
        inner: InMemoryAccountDirectory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccountDirectory for CountingDirectory {
        async fn list_parents(&self, account_id: &str) -> Result<Vec<String>, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_parents(account_id).await
        }
    }

    struct DownDirectory;

    #[async_trait]
    impl AccountDirectory for DownDirectory {
        async fn list_parents(&self, _account_id: &str) -> Result<Vec<String>, DirectoryError> {
            Err(DirectoryError::Unavailable("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn parents_are_cached_per_account() {
        let directory = Arc::new(CountingDirectory {
            inner: InMemoryAccountDirectory::new(),
            calls: AtomicUsize::new(0),
        });
        directory
            .inner
            .insert("111111111111", vec!["ou-prod".to_string()]);
        let resolver = HierarchyResolver::new(directory.clone());

        for _ in 0..3 {
            assert_eq!(
                resolver.parents("111111111111").await.unwrap(),
                vec!["ou-prod".to_string()]
            );
        }
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        resolver.invalidate_all().await;
        resolver.parents("111111111111").await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_account_has_no_parents() {
        let resolver = HierarchyResolver::new(Arc::new(InMemoryAccountDirectory::new()));
        assert!(resolver.parents("999999999999").await.unwrap().is_empty());
        assert_eq!(resolver.cached_accounts().await, 1);
    }

    #[tokio::test]
    async fn failures_resolve_to_empty_and_are_not_cached() {
        let resolver = HierarchyResolver::new(Arc::new(DownDirectory));
        assert!(resolver.parents("111111111111").await.is_err());
        assert!(resolver.parents_or_empty("111111111111").await.is_empty());
        assert_eq!(resolver.cached_accounts().await, 0);
    }
}
