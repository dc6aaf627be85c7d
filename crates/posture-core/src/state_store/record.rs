//! Persisted per-finding remediation state.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::finding::{
    CanonicalFinding, ComplianceStatus, RecordState, SeverityLabel, WorkflowStatus,
};

/// Error for an unrecognised remediation status string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized remediation status: {0:?}")]
pub struct UnknownStatus(pub String);

/// Remediation lifecycle of one finding.
///
/// Moves forward only: `NotStarted` may go anywhere, `InProgress` ends in
/// `Success` or `Failed`, and `Failed` may be retried into `InProgress`.
/// `Success` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationStatus {
    /// No remediation has been started.
    #[default]
    NotStarted,
    /// The orchestrator was invoked and has not reported back.
    InProgress,
    /// Remediation completed.
    Success,
    /// The last remediation attempt failed.
    Failed,
}

impl RemediationStatus {
    /// Parses a status string, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStatus`] for any other value.
    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s.to_uppercase().as_str() {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }

    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// True once a trigger has been issued and has not failed.
    #[must_use]
    pub const fn is_active_trigger(self) -> bool {
        matches!(self, Self::InProgress | Self::Success)
    }

    /// Whether moving to `next` is forward progress (or no change).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, _)
                | (Self::InProgress, Self::InProgress | Self::Success | Self::Failed)
                | (Self::Success, Self::Success)
                | (Self::Failed, Self::Failed | Self::InProgress)
        )
    }
}

impl fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the finding state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingRecord {
    /// Finding id (primary key).
    pub finding_id: String,
    /// Owning account.
    pub account_id: String,
    /// Region the finding was reported in.
    pub region: String,
    /// Security control id.
    pub control_id: String,
    /// Generator id of the finding.
    pub generator_id: String,
    /// Severity label at the last sighting.
    pub severity: SeverityLabel,
    /// Normalized severity, used for ordering.
    pub severity_rank: u8,
    /// Compliance status at the last sighting.
    pub compliance_status: ComplianceStatus,
    /// Record state at the last sighting.
    pub record_state: RecordState,
    /// Workflow status at the last sighting.
    pub workflow_status: WorkflowStatus,
    /// Identifier of the first resource.
    pub resource_id: Option<String>,
    /// Type of the first resource.
    pub resource_type: Option<String>,
    /// Remediation lifecycle.
    pub remediation_status: RemediationStatus,
    /// Orchestrator execution id of the last trigger.
    pub execution_id: Option<String>,
    /// Error text of the last failed trigger.
    pub error: Option<String>,
    /// `UpdatedAt` of the finding at the last sighting.
    pub finding_updated_at: DateTime<Utc>,
    /// When this record was first written.
    pub first_seen: DateTime<Utc>,
    /// When this record was last written.
    pub last_updated_time: DateTime<Utc>,
    /// Time after which the storage layer may expire the row.
    pub expire_at: DateTime<Utc>,
    /// Assigned by the table on every write; used by conditional writes.
    pub version: u64,
}

impl FindingRecord {
    /// Builds a fresh record for a first sighting.
    #[must_use]
    pub fn from_finding(
        finding: &CanonicalFinding,
        status: RemediationStatus,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            finding_id: finding.id.clone(),
            account_id: finding.account_id().to_string(),
            region: finding.region().to_string(),
            control_id: finding.control_id().to_string(),
            generator_id: finding.generator_id.clone(),
            severity: finding.severity_label(),
            severity_rank: finding.severity_normalized(),
            compliance_status: finding.compliance_status(),
            record_state: finding.record_state(),
            workflow_status: finding.workflow_status(),
            resource_id: finding.primary_resource_id().map(str::to_string),
            resource_type: finding.primary_resource_type().map(str::to_string),
            remediation_status: status,
            execution_id: None,
            error: None,
            finding_updated_at: finding.updated_at.instant(),
            first_seen: now,
            last_updated_time: now,
            expire_at: now + retention,
            version: 1,
        }
    }

    /// Returns a copy with descriptive fields taken from `finding` and the
    /// version bumped. Remediation fields are left untouched.
    #[must_use]
    pub fn refreshed(
        &self,
        finding: &CanonicalFinding,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        let mut next = Self::from_finding(finding, self.remediation_status, now, retention);
        next.execution_id.clone_from(&self.execution_id);
        next.error.clone_from(&self.error);
        next.first_seen = self.first_seen;
        next.version = Self::successor_version(Some(self));
        next
    }

    /// Version a write replacing `current` is stored under: 1 for a new row,
    /// otherwise one past the replaced row.
    #[must_use]
    pub fn successor_version(current: Option<&Self>) -> u64 {
        current.map_or(1, |current| current.version.saturating_add(1))
    }
}

/// Condition a [`FindingTable`](super::FindingTable) write must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    None,
    /// No record with this id exists.
    Absent,
    /// The stored record has this remediation status.
    StatusIs(RemediationStatus),
    /// The stored record has this version.
    VersionIs(u64),
}

impl Precondition {
    /// Evaluates the condition against the currently stored record.
    #[must_use]
    pub fn holds(self, current: Option<&FindingRecord>) -> bool {
        match (self, current) {
            (Self::None, _) => true,
            (Self::Absent, current) => current.is_none(),
            (Self::StatusIs(status), Some(current)) => current.remediation_status == status,
            (Self::VersionIs(version), Some(current)) => current.version == version,
            (Self::StatusIs(_) | Self::VersionIs(_), None) => false,
        }
    }
}

/// Result of a conditional write that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was stored.
    Written {
        /// Version the table assigned to the stored row.
        version: u64,
    },
    /// The precondition did not hold; nothing was stored.
    PreconditionFailed,
}
