//! Per-control remediation configuration.
//!
//! Each security control has at most one row in the reference table saying
//! whether a remediation exists for it and whether it runs automatically. A
//! missing row is normal: the control simply has no remediation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;

/// Default number of rows returned per scan page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// One row of the reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationConfigEntry {
    /// Security control id.
    pub control_id: String,
    /// Whether a remediation exists for the control.
    pub supported: bool,
    /// Whether the remediation runs without operator action.
    pub auto_remediation_enabled: bool,
}

/// Reference table errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RemediationConfigError {
    /// The table could not be read.
    #[error("remediation config table unavailable: {0}")]
    Unavailable(String),
}

/// One page of a table scan.
#[derive(Debug, Clone, Default)]
pub struct RemediationConfigPage {
    /// Rows in this page.
    pub entries: Vec<RemediationConfigEntry>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Reference table of remediation configuration rows.
#[async_trait]
pub trait RemediationConfigTable: Send + Sync {
    /// Looks up the row for `control_id`.
    async fn get(
        &self,
        control_id: &str,
    ) -> Result<Option<RemediationConfigEntry>, RemediationConfigError>;

    /// Returns one page of rows starting after `page_token`.
    async fn scan(
        &self,
        page_token: Option<&str>,
    ) -> Result<RemediationConfigPage, RemediationConfigError>;
}

/// Reference table held in memory, scanned in control-id order.
#[derive(Debug)]
pub struct InMemoryRemediationConfigTable {
    rows: RwLock<BTreeMap<String, RemediationConfigEntry>>,
    page_size: usize,
}

impl Default for InMemoryRemediationConfigTable {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_SCAN_PAGE_SIZE)
    }
}

impl InMemoryRemediationConfigTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table returning at most `page_size` rows per scan.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Inserts or replaces a row.
    pub fn upsert(&self, entry: RemediationConfigEntry) {
        self.rows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(entry.control_id.clone(), entry);
    }
}

#[async_trait]
impl RemediationConfigTable for InMemoryRemediationConfigTable {
    async fn get(
        &self,
        control_id: &str,
    ) -> Result<Option<RemediationConfigEntry>, RemediationConfigError> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(control_id)
            .cloned())
    }

    async fn scan(
        &self,
        page_token: Option<&str>,
    ) -> Result<RemediationConfigPage, RemediationConfigError> {
        let rows = self
            .rows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut remaining = rows
            .iter()
            .filter(|(key, _)| page_token.is_none_or(|token| key.as_str() > token))
            .map(|(_, entry)| entry.clone());
        let entries: Vec<_> = remaining.by_ref().take(self.page_size).collect();
        let next_token = if remaining.next().is_some() {
            entries.last().map(|e| e.control_id.clone())
        } else {
            None
        };
        Ok(RemediationConfigPage { entries, next_token })
    }
}

/// Paginates the whole table and returns the ids of supported controls.
///
/// # Errors
///
/// Returns the first scan error.
pub async fn supported_control_ids(
    table: &dyn RemediationConfigTable,
) -> Result<Vec<String>, RemediationConfigError> {
    let mut ids = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = table.scan(token.as_deref()).await?;
        ids.extend(
            page.entries
                .into_iter()
                .filter(|e| e.supported)
                .map(|e| e.control_id),
        );
        match page.next_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => break,
        }
    }
    Ok(ids)
}

// =============================================================================
// Lookup
// =============================================================================

/// Memoized configuration lookup for one control.
///
/// The first query performs a single table read; every later query on the
/// same instance, including after a "not found", reuses it. Failed reads are
/// not memoized.
pub struct RemediationConfigLookup {
    control_id: String,
    table: Arc<dyn RemediationConfigTable>,
    row: OnceCell<Option<RemediationConfigEntry>>,
}

impl RemediationConfigLookup {
    /// Creates a lookup for `control_id`.
    #[must_use]
    pub fn new(control_id: impl Into<String>, table: Arc<dyn RemediationConfigTable>) -> Self {
        Self {
            control_id: control_id.into(),
            table,
            row: OnceCell::new(),
        }
    }

    /// Control this lookup is for.
    #[must_use]
    pub fn control_id(&self) -> &str {
        &self.control_id
    }

    async fn row(&self) -> Result<Option<&RemediationConfigEntry>, RemediationConfigError> {
        let row = self
            .row
            .get_or_try_init(|| async {
                let row = self.table.get(&self.control_id).await?;
                debug!(
                    control_id = %self.control_id,
                    found = row.is_some(),
                    "remediation config loaded"
                );
                Ok::<_, RemediationConfigError>(row)
            })
            .await?;
        Ok(row.as_ref())
    }

    /// Whether a remediation exists for the control.
    ///
    /// # Errors
    ///
    /// Returns the table error if the row could not be read.
    pub async fn is_supported(&self) -> Result<bool, RemediationConfigError> {
        Ok(self.row().await?.is_some_and(|e| e.supported))
    }

    /// Whether the remediation runs automatically.
    ///
    /// # Errors
    ///
    /// Returns the table error if the row could not be read.
    pub async fn is_automation_enabled(&self) -> Result<bool, RemediationConfigError> {
        Ok(self
            .row()
            .await?
            .is_some_and(|e| e.supported && e.auto_remediation_enabled))
    }
}

impl std::fmt::Debug for RemediationConfigLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationConfigLookup")
            .field("control_id", &self.control_id)
            .field("row", &self.row.get())
            .finish_non_exhaustive()
    }
}

/// Hands out one shared [`RemediationConfigLookup`] per control id for the
/// life of the registry.
pub struct RemediationConfigRegistry {
    table: Arc<dyn RemediationConfigTable>,
    lookups: Mutex<HashMap<String, Arc<RemediationConfigLookup>>>,
}

impl RemediationConfigRegistry {
    /// Creates an empty registry over `table`.
    #[must_use]
    pub fn new(table: Arc<dyn RemediationConfigTable>) -> Self {
        Self {
            table,
            lookups: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared lookup for `control_id`.
    #[must_use]
    pub fn lookup(&self, control_id: &str) -> Arc<RemediationConfigLookup> {
        let mut lookups = self
            .lookups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(lookups.entry(control_id.to_string()).or_insert_with(|| {
            Arc::new(RemediationConfigLookup::new(control_id, Arc::clone(&self.table)))
        }))
    }

    /// Drops every memoized lookup.
    pub fn invalidate_all(&self) {
        self.lookups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &Arc<dyn RemediationConfigTable> {
        &self.table
    }
}

impl std::fmt::Debug for RemediationConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationConfigRegistry").finish_non_exhaustive()
    }
}
