//! Outbound seams of the event path: the remediation orchestrator and the
//! remediation history log.
//!
//! ```text
//! RemediationOrchestrator (trait)
//!     |
//!     +-- MockOrchestrator (for testing)
//!     +-- CommandOrchestrator (posture-daemon)
//!
//! RemediationHistory (trait)
//!     |
//!     +-- InMemoryRemediationHistory
//!     +-- SqliteRemediationHistory (posture-daemon)
//! ```
//!
//! Starting an execution is one-way: the orchestrator accepts the request and
//! hands back an opaque execution id. Nothing in this crate waits for or
//! polls the execution.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::EventOrigin;
use crate::finding::CanonicalFinding;
use crate::state_store::FindingRecord;

/// Payload handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationRequest {
    /// The finding to remediate, in canonical form.
    pub finding: CanonicalFinding,
    /// The state record written just before the call.
    pub record: FindingRecord,
    /// Where the triggering event came from.
    pub origin: EventOrigin,
    /// Raw event type of the triggering event.
    pub event_type: String,
    /// Custom action name, when the event was a custom action.
    pub action_name: Option<String>,
    /// When the engine made the request.
    pub requested_at: DateTime<Utc>,
}

/// Handle returned by a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    /// Opaque execution id, kept for audit only.
    pub execution_id: String,
}

/// Orchestrator errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The orchestrator refused the request.
    #[error("orchestrator rejected execution: {0}")]
    Rejected(String),

    /// The orchestrator could not be reached.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// External remediation orchestrator.
#[async_trait]
pub trait RemediationOrchestrator: Send + Sync {
    /// Starts a remediation execution without waiting for it to finish.
    async fn start_execution(
        &self,
        request: &RemediationRequest,
    ) -> Result<ExecutionHandle, OrchestratorError>;
}

/// Orchestrator that records requests and returns sequential ids.
#[derive(Debug, Default)]
pub struct MockOrchestrator {
    counter: AtomicU64,
    started: Mutex<Vec<RemediationRequest>>,
    failure: Mutex<Option<OrchestratorError>>,
}

impl MockOrchestrator {
    /// Creates a mock that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that rejects every request with `error`.
    #[must_use]
    pub fn failing(error: OrchestratorError) -> Self {
        let mock = Self::default();
        mock.fail_with(Some(error));
        mock
    }

    /// Sets or clears the error returned by later calls.
    pub fn fail_with(&self, error: Option<OrchestratorError>) {
        *self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = error;
    }

    /// Requests accepted so far.
    #[must_use]
    pub fn started(&self) -> Vec<RemediationRequest> {
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of requests accepted so far.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl RemediationOrchestrator for MockOrchestrator {
    async fn start_execution(
        &self,
        request: &RemediationRequest,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        if let Some(error) = self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        Ok(ExecutionHandle {
            execution_id: format!("exec-mock-{}-{n}", request.finding.control_id()),
        })
    }
}

// =============================================================================
// History
// =============================================================================

/// One remediation history row, appended after a successful trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationHistoryEntry {
    /// Finding id.
    pub finding_id: String,
    /// Control id.
    pub control_id: String,
    /// Owning account.
    pub account_id: String,
    /// Orchestrator execution id.
    pub execution_id: String,
    /// Origin of the triggering event.
    pub origin: EventOrigin,
    /// When the trigger was issued.
    pub triggered_at: DateTime<Utc>,
}

/// History log errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HistoryError {
    /// The log could not be written.
    #[error("remediation history unavailable: {0}")]
    Unavailable(String),
}

/// Append-only remediation history.
#[async_trait]
pub trait RemediationHistory: Send + Sync {
    /// Appends one entry.
    async fn append(&self, entry: RemediationHistoryEntry) -> Result<(), HistoryError>;
}

/// History kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryRemediationHistory {
    entries: Mutex<Vec<RemediationHistoryEntry>>,
}

impl InMemoryRemediationHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries appended so far, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<RemediationHistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RemediationHistory for InMemoryRemediationHistory {
    async fn append(&self, entry: RemediationHistoryEntry) -> Result<(), HistoryError> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}
