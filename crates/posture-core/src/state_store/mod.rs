//! Per-finding remediation state with optimistic concurrency.
//!
//! The event path and the reconciliation sweep both write here, possibly at
//! the same time and for the same finding. No lock is taken: every write is a
//! conditional put against the row the writer just read, and the loser of a
//! race sees [`UpsertStatus::Failed`] instead of an error.
//!
//! # Write rules
//!
//! | Situation                                   | Precondition                  |
//! |---------------------------------------------|-------------------------------|
//! | no record yet                               | [`Precondition::Absent`]      |
//! | event path, status transition requested     | [`Precondition::StatusIs`]    |
//! | event path, refresh only                    | [`Precondition::VersionIs`]   |
//! | reconciliation (`allow_overwrite`)          | [`Precondition::VersionIs`]   |
//!
//! The table assigns versions, so a row replaced under `StatusIs` still
//! invalidates every `VersionIs` writer that read the row before it.
//!
//! An event-path transition that is not forward progress from the observed
//! status is refused without writing. Reconciliation never moves the status
//! backwards; it only refreshes descriptive fields.
//!
//! Together these give at most one in-flight trigger per finding id: of N
//! writers that observed `NotStarted` and ask for `InProgress`, exactly one
//! write lands.

mod record;
mod table;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

pub use record::{FindingRecord, Precondition, RemediationStatus, UnknownStatus, WriteOutcome};
pub use table::{FindingTable, InMemoryFindingTable, StoreError};

use crate::finding::CanonicalFinding;

/// Default record retention.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Attempts [`FindingStateStore::record_outcome`] makes before giving up on
/// a contended row.
const OUTCOME_WRITE_ATTEMPTS: usize = 3;

/// Source of "now" for record timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock [`Clock`].
#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Existence check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// No record exists for the finding id.
    pub is_new: bool,
}

/// Outcome class of [`FindingStateStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    /// The record was written.
    Success,
    /// Another writer got there first; the caller must not trigger.
    Failed,
    /// The write could not be confirmed.
    Error,
}

/// Result of [`FindingStateStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    /// Outcome class.
    pub status: UpsertStatus,
    /// The record as written, on success.
    pub record: Option<FindingRecord>,
}

impl UpsertResult {
    fn success(record: FindingRecord) -> Self {
        Self {
            status: UpsertStatus::Success,
            record: Some(record),
        }
    }

    const fn failed() -> Self {
        Self {
            status: UpsertStatus::Failed,
            record: None,
        }
    }

    const fn error() -> Self {
        Self {
            status: UpsertStatus::Error,
            record: None,
        }
    }
}

/// Reads and conditionally writes [`FindingRecord`]s.
pub struct FindingStateStore {
    table: Arc<dyn FindingTable>,
    clock: Clock,
    retention: Duration,
}

impl FindingStateStore {
    /// Creates a store over `table` using the wall clock and the default
    /// retention.
    #[must_use]
    pub fn new(table: Arc<dyn FindingTable>) -> Self {
        Self {
            table,
            clock: system_clock(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retention period used for `expire_at`.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Reads the record for `finding_id`.
    ///
    /// # Errors
    ///
    /// Returns the table fault.
    pub async fn observe(&self, finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        self.table.get(finding_id).await
    }

    /// Reports whether a record exists for the finding.
    ///
    /// # Errors
    ///
    /// Returns the table fault.
    pub async fn classify(&self, finding: &CanonicalFinding) -> Result<Classification, StoreError> {
        Ok(Classification {
            is_new: self.observe(&finding.id).await?.is_none(),
        })
    }

    /// True when the stored status is `InProgress` or `Success`.
    ///
    /// # Errors
    ///
    /// Returns the table fault.
    pub async fn has_active_trigger(&self, finding: &CanonicalFinding) -> Result<bool, StoreError> {
        Ok(self
            .observe(&finding.id)
            .await?
            .is_some_and(|r| r.remediation_status.is_active_trigger()))
    }

    /// True when the stored status is `Failed`.
    ///
    /// # Errors
    ///
    /// Returns the table fault.
    pub async fn has_failed_trigger(&self, finding: &CanonicalFinding) -> Result<bool, StoreError> {
        Ok(self
            .observe(&finding.id)
            .await?
            .is_some_and(|r| r.remediation_status == RemediationStatus::Failed))
    }

    /// Writes or refreshes the record for `finding`.
    ///
    /// `desired_status` is the remediation status the caller wants the record
    /// to end up in; `None` keeps whatever is stored (`NotStarted` for a new
    /// record). `allow_overwrite` selects reconciliation semantics; see the
    /// module docs.
    pub async fn upsert(
        &self,
        finding: &CanonicalFinding,
        desired_status: Option<RemediationStatus>,
        allow_overwrite: bool,
    ) -> UpsertResult {
        let now = (self.clock)();
        let current = match self.table.get(&finding.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(finding_id = %finding.id, error = %e, "finding record read failed");
                return UpsertResult::error();
            },
        };

        let (record, precondition) = match current {
            None => (
                FindingRecord::from_finding(
                    finding,
                    desired_status.unwrap_or_default(),
                    now,
                    self.retention,
                ),
                Precondition::Absent,
            ),
            Some(current) => {
                let observed = current.remediation_status;
                let mut next = current.refreshed(finding, now, self.retention);
                let precondition = match desired_status {
                    Some(status) if status != observed && observed.can_transition_to(status) => {
                        next.remediation_status = status;
                        if status == RemediationStatus::InProgress {
                            next.execution_id = None;
                            next.error = None;
                        }
                        if allow_overwrite {
                            Precondition::VersionIs(current.version)
                        } else {
                            Precondition::StatusIs(observed)
                        }
                    },
                    Some(status) if !allow_overwrite => {
                        debug!(
                            finding_id = %finding.id,
                            observed = %observed,
                            requested = %status,
                            "status already advanced, refusing transition"
                        );
                        return UpsertResult::failed();
                    },
                    _ => Precondition::VersionIs(current.version),
                };
                (next, precondition)
            },
        };

        match self.table.put(record.clone(), precondition).await {
            Ok(WriteOutcome::Written { version }) => {
                let mut record = record;
                record.version = version;
                debug!(
                    finding_id = %record.finding_id,
                    remediation_status = %record.remediation_status,
                    version = record.version,
                    "finding record written"
                );
                UpsertResult::success(record)
            },
            Ok(WriteOutcome::PreconditionFailed) => {
                debug!(finding_id = %finding.id, ?precondition, "concurrent write detected");
                UpsertResult::failed()
            },
            Err(e) => {
                warn!(finding_id = %finding.id, error = %e, "finding record write failed");
                UpsertResult::error()
            },
        }
    }

    /// Records the result of an orchestrator call on an existing record.
    ///
    /// `execution_id` replaces the stored id when given; `error` always
    /// replaces the stored error text. A transition that would move the
    /// status backwards is not applied and reports
    /// [`WriteOutcome::PreconditionFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when there is no record, or the table
    /// fault.
    pub async fn record_outcome(
        &self,
        finding_id: &str,
        status: RemediationStatus,
        execution_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<WriteOutcome, StoreError> {
        for _ in 0..OUTCOME_WRITE_ATTEMPTS {
            let current = self
                .table
                .get(finding_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    finding_id: finding_id.to_string(),
                })?;
            if !current.remediation_status.can_transition_to(status) {
                debug!(
                    finding_id = %finding_id,
                    observed = %current.remediation_status,
                    requested = %status,
                    "outcome would regress status, ignoring"
                );
                return Ok(WriteOutcome::PreconditionFailed);
            }

            let mut next = current.clone();
            next.remediation_status = status;
            if let Some(execution_id) = execution_id {
                next.execution_id = Some(execution_id.to_string());
            }
            next.error = error.map(str::to_string);
            next.last_updated_time = (self.clock)();

            match self
                .table
                .put(next, Precondition::VersionIs(current.version))
                .await?
            {
                written @ WriteOutcome::Written { .. } => return Ok(written),
                WriteOutcome::PreconditionFailed => {
                    debug!(finding_id = %finding_id, "outcome write contended, retrying");
                },
            }
        }
        Ok(WriteOutcome::PreconditionFailed)
    }
}

impl std::fmt::Debug for FindingStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindingStateStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
