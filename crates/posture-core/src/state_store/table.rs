//! Key-value persistence seam for finding records.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use super::record::{FindingRecord, Precondition, WriteOutcome};

/// Persistence faults. A failed precondition is not a fault; see
/// [`WriteOutcome::PreconditionFailed`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or rejected the request.
    #[error("finding store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt record for finding {finding_id}: {reason}")]
    Corrupt {
        /// Row key.
        finding_id: String,
        /// Decoder message.
        reason: String,
    },

    /// The record to update does not exist.
    #[error("no record for finding {finding_id}")]
    NotFound {
        /// Requested key.
        finding_id: String,
    },
}

/// Conditional-write key-value table of [`FindingRecord`]s.
#[async_trait]
pub trait FindingTable: Send + Sync {
    /// Reads the record for `finding_id`.
    async fn get(&self, finding_id: &str) -> Result<Option<FindingRecord>, StoreError>;

    /// Stores `record` if `precondition` holds against the current row,
    /// atomically with respect to other writers.
    ///
    /// The stored version is always
    /// [`FindingRecord::successor_version`] of the replaced row, whatever
    /// `record.version` holds, so two different rows of one finding never
    /// share a version.
    async fn put(
        &self,
        record: FindingRecord,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError>;
}

/// Table held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryFindingTable {
    rows: RwLock<HashMap<String, FindingRecord>>,
}

impl InMemoryFindingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FindingTable for InMemoryFindingTable {
    async fn get(&self, finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(finding_id)
            .cloned())
    }

    async fn put(
        &self,
        mut record: FindingRecord,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        let mut rows = self
            .rows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = rows.get(&record.finding_id);
        if !precondition.holds(current) {
            return Ok(WriteOutcome::PreconditionFailed);
        }
        let version = FindingRecord::successor_version(current);
        record.version = version;
        rows.insert(record.finding_id.clone(), record);
        Ok(WriteOutcome::Written { version })
    }
}
