//! Event-path decision engine.
//!
//! Each finding in an incoming event moves through:
//!
//! ```text
//! Received -> Normalized -> Unsupported (drop)
//!                        -> FilteredOut (drop)
//!                        -> Classified -> Decided -> Persisted -> Triggered
//!                                                              -> Skipped
//! ```
//!
//! A trigger is issued only when the state store write that moves the record
//! to `InProgress` lands. Losing that write to a concurrent writer, or not
//! being able to confirm it, skips the trigger: a missed trigger is picked up
//! by the next event or sweep, a duplicate one is not recoverable.
//!
//! # Failure semantics
//!
//! Malformed input and unsupported controls are terminal outcomes, not
//! errors. Faults talking to the remediation config table, the state store
//! or the orchestrator are returned as [`IngestionError`]s and are retryable
//! by redelivery. Writes after a successful trigger (execution id, history)
//! are best effort and only logged.

mod orchestrator;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use orchestrator::{
    ExecutionHandle, HistoryError, InMemoryRemediationHistory, MockOrchestrator, OrchestratorError,
    RemediationHistory, RemediationHistoryEntry, RemediationOrchestrator, RemediationRequest,
};

use crate::filter::{FilterAxis, FilterEngine};
use crate::finding::{CanonicalFinding, ComplianceStatus, RecordState, WorkflowStatus};
use crate::metrics::{BestEffortMetrics, PipelineMetric};
use crate::normalize::SchemaNormalizer;
use crate::remediation_config::{RemediationConfigError, RemediationConfigRegistry};
use crate::state_store::{
    Clock, FindingRecord, FindingStateStore, RemediationStatus, StoreError, UpsertStatus,
    system_clock,
};

/// Event type of findings imported by the producing service.
pub const DETAIL_TYPE_IMPORTED: &str = "Security Hub Findings - Imported";

/// Event type of operator-initiated custom actions.
pub const DETAIL_TYPE_CUSTOM_ACTION: &str = "Security Hub Findings - Custom Action";

/// Event type of findings submitted through the remediation API.
pub const DETAIL_TYPE_API_ACTION: &str = "Security Hub Findings - API Action";

// =============================================================================
// Events
// =============================================================================

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Routine import by the producing service.
    Imported,
    /// An operator ran a custom action on the finding.
    CustomAction,
    /// A caller submitted the finding through the API.
    ApiAction,
}

impl EventOrigin {
    /// Classifies an event by its detail type. Anything unrecognised is
    /// treated as a routine import.
    #[must_use]
    pub fn from_detail_type(detail_type: &str) -> Self {
        match detail_type.trim() {
            DETAIL_TYPE_CUSTOM_ACTION => Self::CustomAction,
            DETAIL_TYPE_API_ACTION => Self::ApiAction,
            _ => Self::Imported,
        }
    }

    /// True for explicit operator or API requests.
    #[must_use]
    pub const fn is_explicit_action(self) -> bool {
        matches!(self, Self::CustomAction | Self::ApiAction)
    }

    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::CustomAction => "custom_action",
            Self::ApiAction => "api_action",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-event metadata passed alongside each finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Event origin.
    pub origin: EventOrigin,
    /// Raw event type.
    pub event_type: String,
    /// Custom action name, if any.
    pub action_name: Option<String>,
}

impl EventContext {
    /// Context for a routine import.
    #[must_use]
    pub fn imported() -> Self {
        Self {
            origin: EventOrigin::Imported,
            event_type: DETAIL_TYPE_IMPORTED.to_string(),
            action_name: None,
        }
    }

    /// Context for an operator custom action.
    #[must_use]
    pub fn custom_action(action_name: impl Into<String>) -> Self {
        Self {
            origin: EventOrigin::CustomAction,
            event_type: DETAIL_TYPE_CUSTOM_ACTION.to_string(),
            action_name: Some(action_name.into()),
        }
    }
}

/// Body of a [`FindingEvent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingEventDetail {
    /// Raw findings, in either supported schema.
    #[serde(default)]
    pub findings: Vec<Value>,
    /// Custom action name.
    #[serde(rename = "actionName", default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
}

/// A delivered event carrying one or more raw findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingEvent {
    /// Event id assigned by the delivery system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event type.
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    /// Event body.
    pub detail: FindingEventDetail,
}

impl FindingEvent {
    /// Parses an event envelope.
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the envelope is malformed.
    pub fn from_value(raw: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }

    /// Context shared by every finding in this event.
    #[must_use]
    pub fn context(&self) -> EventContext {
        EventContext {
            origin: EventOrigin::from_detail_type(&self.detail_type),
            event_type: self.detail_type.clone(),
            action_name: self.detail.action_name.clone(),
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Facts the trigger decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerInputs {
    /// Automatic remediation is enabled for the control.
    pub automation_enabled: bool,
    /// Compliance status of the finding.
    pub compliance_status: ComplianceStatus,
    /// Record state of the finding.
    pub record_state: RecordState,
    /// No state record existed.
    pub is_new: bool,
    /// The stored status is `InProgress` or `Success`.
    pub has_active_trigger: bool,
    /// The stored status is `Failed`.
    pub has_failed_trigger: bool,
}

/// The trigger-eligibility predicate, shared by new and existing findings.
#[must_use]
pub fn should_trigger(inputs: &TriggerInputs) -> bool {
    inputs.automation_enabled
        && inputs.compliance_status == ComplianceStatus::Failed
        && inputs.record_state != RecordState::Archived
        && (inputs.is_new || !inputs.has_active_trigger || inputs.has_failed_trigger)
}

/// Why a finding was persisted without a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The trigger predicate was false.
    NotEligible,
    /// Another writer advanced the record first.
    Contention,
    /// The state store write could not be confirmed.
    WriteUnconfirmed,
}

/// Terminal outcome for one finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    /// The payload could not be normalized; dropped permanently.
    Malformed {
        /// Normalization error text.
        reason: String,
    },
    /// The control has no remediation; dropped.
    Unsupported {
        /// Control id.
        control_id: String,
    },
    /// A filter rejected the finding; dropped before any write.
    FilteredOut {
        /// The rejecting axis.
        axis: FilterAxis,
    },
    /// Persisted, no trigger.
    Skipped {
        /// Why nothing was triggered.
        reason: SkipReason,
    },
    /// The orchestrator accepted a remediation.
    Triggered {
        /// Execution id returned by the orchestrator.
        execution_id: String,
    },
}

impl IngestionOutcome {
    /// Short label for the outcome variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::Unsupported { .. } => "unsupported",
            Self::FilteredOut { .. } => "filtered_out",
            Self::Skipped { .. } => "skipped",
            Self::Triggered { .. } => "triggered",
        }
    }

    /// Whether the orchestrator was invoked.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        matches!(self, Self::Triggered { .. })
    }
}

/// Retryable event-path failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestionError {
    /// The event envelope could not be decoded.
    #[error("malformed event envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The remediation config table failed.
    #[error(transparent)]
    RemediationConfig(#[from] RemediationConfigError),

    /// The state store failed while classifying the finding.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The orchestrator did not accept the execution.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl IngestionError {
    /// Whether redelivering the event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Envelope(_))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runs the per-finding state machine.
pub struct IngestionEngine {
    normalizer: SchemaNormalizer,
    remediation: Arc<RemediationConfigRegistry>,
    filters: Arc<FilterEngine>,
    store: Arc<FindingStateStore>,
    orchestrator: Arc<dyn RemediationOrchestrator>,
    history: Arc<dyn RemediationHistory>,
    metrics: BestEffortMetrics,
    clock: Clock,
}

impl IngestionEngine {
    /// Wires an engine with metrics disabled.
    #[must_use]
    pub fn new(
        remediation: Arc<RemediationConfigRegistry>,
        filters: Arc<FilterEngine>,
        store: Arc<FindingStateStore>,
        orchestrator: Arc<dyn RemediationOrchestrator>,
        history: Arc<dyn RemediationHistory>,
    ) -> Self {
        Self {
            normalizer: SchemaNormalizer::new(BestEffortMetrics::disabled()),
            remediation,
            filters,
            store,
            orchestrator,
            history,
            metrics: BestEffortMetrics::disabled(),
            clock: system_clock(),
        }
    }

    /// Routes pipeline metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: BestEffortMetrics) -> Self {
        self.normalizer = SchemaNormalizer::new(metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Replaces the clock used for request and history timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Decodes a raw event envelope and processes it.
    ///
    /// # Errors
    ///
    /// Returns [`IngestionError::Envelope`] for an undecodable envelope,
    /// otherwise as [`process_event`](Self::process_event).
    pub async fn process_raw_event(
        &self,
        raw: &Value,
    ) -> Result<Vec<IngestionOutcome>, IngestionError> {
        let event = FindingEvent::from_value(raw)?;
        self.process_event(&event).await
    }

    /// Processes every finding of a delivered event.
    ///
    /// All findings are attempted even if one fails; the first error is
    /// returned after the rest have been processed so redelivery retries
    /// the event.
    ///
    /// # Errors
    ///
    /// Returns the first [`IngestionError`] raised by any finding.
    pub async fn process_event(
        &self,
        event: &FindingEvent,
    ) -> Result<Vec<IngestionOutcome>, IngestionError> {
        let context = event.context();
        let mut outcomes = Vec::with_capacity(event.detail.findings.len());
        let mut first_error = None;
        for raw in &event.detail.findings {
            match self.process(raw, &context).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(event_id = ?event.id, error = %e, "finding processing failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                },
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Processes one raw finding.
    ///
    /// # Errors
    ///
    /// Returns a retryable [`IngestionError`] on infrastructure faults.
    pub async fn process(
        &self,
        raw: &Value,
        context: &EventContext,
    ) -> Result<IngestionOutcome, IngestionError> {
        let mut finding = match self.normalizer.normalize(raw) {
            Ok(finding) => finding,
            Err(e) => {
                warn!(error = %e, "dropping malformed finding");
                self.metrics.record(PipelineMetric::NormalizationFailed { reason: e.reason() });
                return Ok(IngestionOutcome::Malformed { reason: e.to_string() });
            },
        };
        let control_id = finding.control_id().to_string();

        let lookup = self.remediation.lookup(&control_id);
        if !lookup.is_supported().await? {
            debug!(
                finding_id = %finding.id,
                control_id = %control_id,
                "control has no remediation"
            );
            return Ok(IngestionOutcome::Unsupported { control_id });
        }

        let filtered = self.filters.apply_all(&finding).await;
        if let Some(axis) = filtered.applied_filter.filter(|_| !filtered.passed) {
            info!(
                finding_id = %finding.id,
                applied_filter = axis.as_str(),
                "finding filtered out"
            );
            self.metrics.record(PipelineMetric::FindingFiltered { axis });
            return Ok(IngestionOutcome::FilteredOut { axis });
        }

        let is_new = self.store.classify(&finding).await?.is_new;
        let (has_active_trigger, has_failed_trigger) = if is_new {
            (false, false)
        } else {
            (
                self.store.has_active_trigger(&finding).await?,
                self.store.has_failed_trigger(&finding).await?,
            )
        };
        let trigger = should_trigger(&TriggerInputs {
            automation_enabled: lookup.is_automation_enabled().await?,
            compliance_status: finding.compliance_status(),
            record_state: finding.record_state(),
            is_new,
            has_active_trigger,
            has_failed_trigger,
        });

        let notified_carve_out = finding.workflow_status() == WorkflowStatus::Notified
            && !context.origin.is_explicit_action();
        if notified_carve_out {
            debug!(finding_id = %finding.id, "re-evaluating notified finding as new");
            finding.set_workflow_status(WorkflowStatus::New);
        }

        let desired = trigger.then_some(RemediationStatus::InProgress);
        let written = self.store.upsert(&finding, desired, false).await;
        let record = match (written.status, written.record) {
            (UpsertStatus::Success, Some(record)) if trigger => record,
            (UpsertStatus::Success, _) => {
                debug!(finding_id = %finding.id, is_new, "finding persisted, not eligible");
                return Ok(IngestionOutcome::Skipped {
                    reason: SkipReason::NotEligible,
                });
            },
            (UpsertStatus::Failed, _) => {
                info!(
                    finding_id = %finding.id,
                    "another writer owns this finding, skipping trigger"
                );
                return Ok(IngestionOutcome::Skipped {
                    reason: SkipReason::Contention,
                });
            },
            (UpsertStatus::Error, _) => {
                warn!(finding_id = %finding.id, "state write unconfirmed, skipping trigger");
                return Ok(IngestionOutcome::Skipped {
                    reason: SkipReason::WriteUnconfirmed,
                });
            },
        };

        self.trigger(finding, record, context, notified_carve_out).await
    }

    async fn trigger(
        &self,
        finding: CanonicalFinding,
        record: FindingRecord,
        context: &EventContext,
        skip_history: bool,
    ) -> Result<IngestionOutcome, IngestionError> {
        let now = (self.clock)();
        let request = RemediationRequest {
            finding,
            record,
            origin: context.origin,
            event_type: context.event_type.clone(),
            action_name: context.action_name.clone(),
            requested_at: now,
        };
        let finding_id = request.finding.id.clone();
        let control_id = request.finding.control_id().to_string();

        let handle = match self.orchestrator.start_execution(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    finding_id = %finding_id,
                    control_id = %control_id,
                    error = %e,
                    "orchestrator rejected remediation"
                );
                let error_text = e.to_string();
                if let Err(store_err) = self
                    .store
                    .record_outcome(&finding_id, RemediationStatus::Failed, None, Some(&error_text))
                    .await
                {
                    warn!(
                        finding_id = %finding_id,
                        error = %store_err,
                        "could not mark trigger failed"
                    );
                }
                return Err(e.into());
            },
        };

        info!(
            finding_id = %finding_id,
            control_id = %control_id,
            execution_id = %handle.execution_id,
            origin = %context.origin,
            "remediation triggered"
        );
        self.metrics.record(PipelineMetric::RemediationTriggered {
            control_id: control_id.clone(),
        });

        if skip_history {
            return Ok(IngestionOutcome::Triggered {
                execution_id: handle.execution_id,
            });
        }

        if let Err(e) = self
            .store
            .record_outcome(
                &finding_id,
                RemediationStatus::InProgress,
                Some(&handle.execution_id),
                None,
            )
            .await
        {
            warn!(finding_id = %finding_id, error = %e, "could not record execution id");
        }

        let entry = RemediationHistoryEntry {
            finding_id: finding_id.clone(),
            control_id,
            account_id: request.finding.account_id().to_string(),
            execution_id: handle.execution_id.clone(),
            origin: context.origin,
            triggered_at: now,
        };
        if let Err(e) = self.history.append(entry).await {
            warn!(finding_id = %finding_id, error = %e, "could not append remediation history");
        }

        Ok(IngestionOutcome::Triggered {
            execution_id: handle.execution_id,
        })
    }
}

impl fmt::Debug for IngestionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionEngine")
            .field("filters", &self.filters)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
