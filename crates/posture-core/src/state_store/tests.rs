//! State store tests: conditional writes, races and status monotonicity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeZone;
use futures::future::join_all;
use proptest::prelude::*;

use super::*;
use crate::finding::fixtures::asff;
use crate::finding::{ComplianceStatus, WorkflowStatus};

// =============================================================================
// Helpers
// =============================================================================

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn store_over(table: Arc<dyn FindingTable>) -> FindingStateStore {
    FindingStateStore::new(table).with_clock(Arc::new(fixed_now))
}

fn finding(id: &str) -> CanonicalFinding {
    CanonicalFinding::from_canonical(&asff(id, "S3.1", "111111111111")).unwrap()
}

/// Yields between the read and the write so concurrent writers interleave.
#[derive(Default)]
struct InterleavingTable {
    inner: InMemoryFindingTable,
}

#[async_trait]
impl FindingTable for InterleavingTable {
    async fn get(&self, finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        let row = self.inner.get(finding_id).await;
        tokio::task::yield_now().await;
        row
    }

    async fn put(
        &self,
        record: FindingRecord,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        self.inner.put(record, precondition).await
    }
}

/// Answers reads with a row observed earlier while writing to the shared
/// table, standing in for a writer whose read was overtaken.
struct StaleRead {
    shared: Arc<InMemoryFindingTable>,
    seen: FindingRecord,
}

#[async_trait]
impl FindingTable for StaleRead {
    async fn get(&self, _finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        Ok(Some(self.seen.clone()))
    }

    async fn put(
        &self,
        record: FindingRecord,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        self.shared.put(record, precondition).await
    }
}

struct BrokenTable;

#[async_trait]
impl FindingTable for BrokenTable {
    async fn get(&self, _finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        Ok(None)
    }

    async fn put(
        &self,
        _record: FindingRecord,
        _precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        Err(StoreError::Unavailable("throttled".into()))
    }
}

// =============================================================================
// RemediationStatus
// =============================================================================

#[test]
fn status_parse_and_as_str() {
    for status in [
        RemediationStatus::NotStarted,
        RemediationStatus::InProgress,
        RemediationStatus::Success,
        RemediationStatus::Failed,
    ] {
        assert_eq!(RemediationStatus::parse(status.as_str()).unwrap(), status);
    }
    assert_eq!(
        RemediationStatus::parse("in_progress").unwrap(),
        RemediationStatus::InProgress
    );
    assert!(RemediationStatus::parse("DONE").is_err());
}

#[test]
fn status_transitions_only_move_forward() {
    use RemediationStatus::{Failed, InProgress, NotStarted, Success};

    assert!(NotStarted.can_transition_to(InProgress));
    assert!(InProgress.can_transition_to(Success));
    assert!(InProgress.can_transition_to(Failed));
    assert!(Failed.can_transition_to(InProgress));

    assert!(!InProgress.can_transition_to(NotStarted));
    assert!(!Success.can_transition_to(InProgress));
    assert!(!Success.can_transition_to(NotStarted));
    assert!(!Failed.can_transition_to(NotStarted));
}

#[test]
fn precondition_evaluation() {
    let record = FindingRecord::from_finding(
        &finding("f-1"),
        RemediationStatus::InProgress,
        fixed_now(),
        Duration::days(1),
    );
    assert!(Precondition::None.holds(None));
    assert!(Precondition::Absent.holds(None));
    assert!(!Precondition::Absent.holds(Some(&record)));
    assert!(Precondition::StatusIs(RemediationStatus::InProgress).holds(Some(&record)));
    assert!(!Precondition::StatusIs(RemediationStatus::NotStarted).holds(Some(&record)));
    assert!(Precondition::VersionIs(1).holds(Some(&record)));
    assert!(!Precondition::VersionIs(2).holds(Some(&record)));
    assert!(!Precondition::VersionIs(1).holds(None));
}

// =============================================================================
// Record lifecycle
// =============================================================================

#[tokio::test]
async fn first_sighting_creates_record() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("f-1");
    assert!(store.classify(&finding).await.unwrap().is_new);

    let result = store.upsert(&finding, None, false).await;
    assert_eq!(result.status, UpsertStatus::Success);
    let record = result.record.unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::NotStarted);
    assert_eq!(record.control_id, "S3.1");
    assert_eq!(record.severity_rank, 70);
    assert_eq!(record.compliance_status, ComplianceStatus::Failed);
    assert_eq!(record.expire_at, fixed_now() + Duration::days(DEFAULT_RETENTION_DAYS));
    assert_eq!(record.version, 1);

    assert!(!store.classify(&finding).await.unwrap().is_new);
    assert!(!store.has_active_trigger(&finding).await.unwrap());
    assert!(!store.has_failed_trigger(&finding).await.unwrap());
}

#[tokio::test]
async fn absent_record_has_no_trigger() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("missing");
    assert!(!store.has_active_trigger(&finding).await.unwrap());
    assert!(!store.has_failed_trigger(&finding).await.unwrap());
}

#[tokio::test]
async fn refresh_preserves_remediation_fields() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let mut finding = finding("f-1");
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    store
        .record_outcome("f-1", RemediationStatus::InProgress, Some("exec-1"), None)
        .await
        .unwrap();

    finding.set_workflow_status(WorkflowStatus::Notified);
    let result = store.upsert(&finding, None, false).await;
    assert_eq!(result.status, UpsertStatus::Success);
    let record = result.record.unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    assert_eq!(record.execution_id.as_deref(), Some("exec-1"));
    assert_eq!(record.workflow_status, WorkflowStatus::Notified);
    assert_eq!(record.version, 3);
}

#[tokio::test]
async fn event_path_refuses_duplicate_trigger() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("f-1");
    let first = store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    assert_eq!(first.status, UpsertStatus::Success);
    assert!(store.has_active_trigger(&finding).await.unwrap());

    let second = store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    assert_eq!(second.status, UpsertStatus::Failed);
}

#[tokio::test]
async fn failed_trigger_can_be_retried() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("f-1");
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    store
        .record_outcome("f-1", RemediationStatus::Failed, None, Some("boom"))
        .await
        .unwrap();
    assert!(store.has_failed_trigger(&finding).await.unwrap());

    let retry = store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    assert_eq!(retry.status, UpsertStatus::Success);
    let record = retry.record.unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn record_outcome_requires_existing_record() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let err = store
        .record_outcome("nope", RemediationStatus::Success, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn record_outcome_never_regresses() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("f-1");
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    store
        .record_outcome("f-1", RemediationStatus::Success, None, None)
        .await
        .unwrap();
    let outcome = store
        .record_outcome("f-1", RemediationStatus::Failed, None, Some("late"))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::PreconditionFailed);
    let record = store.observe("f-1").await.unwrap().unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::Success);
}

#[tokio::test]
async fn write_fault_is_error_not_failed() {
    let store = store_over(Arc::new(BrokenTable));
    let result = store.upsert(&finding("f-1"), None, false).await;
    assert_eq!(result.status, UpsertStatus::Error);
    assert!(result.record.is_none());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_new_finding_triggers_exactly_once() {
    let store = store_over(Arc::new(InterleavingTable::default()));
    let finding = finding("f-race");

    let results = join_all(
        (0..8).map(|_| store.upsert(&finding, Some(RemediationStatus::InProgress), false)),
    )
    .await;

    let successes = results
        .iter()
        .filter(|r| r.status == UpsertStatus::Success)
        .count();
    let failures = results
        .iter()
        .filter(|r| r.status == UpsertStatus::Failed)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(failures, 7);
}

#[tokio::test]
async fn concurrent_retries_of_failed_trigger_win_once() {
    let store = store_over(Arc::new(InterleavingTable::default()));
    let finding = finding("f-retry");
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;
    store
        .record_outcome("f-retry", RemediationStatus::Failed, None, Some("boom"))
        .await
        .unwrap();

    let results = join_all(
        (0..5).map(|_| store.upsert(&finding, Some(RemediationStatus::InProgress), false)),
    )
    .await;
    assert_eq!(
        results
            .iter()
            .filter(|r| r.status == UpsertStatus::Success)
            .count(),
        1
    );
}

#[tokio::test]
async fn reconciliation_does_not_revert_in_progress() {
    let store = store_over(Arc::new(InMemoryFindingTable::new()));
    let finding = finding("f-1");
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;

    let swept = store.upsert(&finding, None, true).await;
    assert_eq!(swept.status, UpsertStatus::Success);
    assert_eq!(
        swept.record.unwrap().remediation_status,
        RemediationStatus::InProgress
    );

    let swept = store
        .upsert(&finding, Some(RemediationStatus::NotStarted), true)
        .await;
    assert_eq!(swept.status, UpsertStatus::Success);
    assert_eq!(
        swept.record.unwrap().remediation_status,
        RemediationStatus::InProgress
    );
}

#[tokio::test]
async fn reconciliation_collision_reports_failed() {
    let store = store_over(Arc::new(InterleavingTable::default()));
    let finding = finding("f-1");
    store.upsert(&finding, None, true).await;

    let results = join_all((0..3).map(|_| store.upsert(&finding, None, true))).await;
    assert_eq!(
        results
            .iter()
            .filter(|r| r.status == UpsertStatus::Success)
            .count(),
        1
    );
    assert!(results
        .iter()
        .all(|r| r.status != UpsertStatus::Error));
}

#[tokio::test]
async fn transition_over_refreshed_row_invalidates_later_reconciliation() {
    let shared = Arc::new(InMemoryFindingTable::new());
    let store = store_over(shared.clone());
    let finding = finding("f-1");
    store.upsert(&finding, None, false).await;
    let event_read = shared.get("f-1").await.unwrap().unwrap();

    store.upsert(&finding, None, true).await;
    let sweep_read = shared.get("f-1").await.unwrap().unwrap();
    assert_eq!(sweep_read.version, 2);

    let event = store_over(Arc::new(StaleRead {
        shared: shared.clone(),
        seen: event_read,
    }))
    .upsert(&finding, Some(RemediationStatus::InProgress), false)
    .await;
    assert_eq!(event.status, UpsertStatus::Success);
    assert_eq!(event.record.unwrap().version, 3);

    let sweep = store_over(Arc::new(StaleRead {
        shared: shared.clone(),
        seen: sweep_read,
    }))
    .upsert(&finding, None, true)
    .await;
    assert_eq!(sweep.status, UpsertStatus::Failed);

    let stored = shared.get("f-1").await.unwrap().unwrap();
    assert_eq!(stored.remediation_status, RemediationStatus::InProgress);
    assert_eq!(stored.version, 3);
    assert!(store.has_active_trigger(&finding).await.unwrap());
}

#[tokio::test]
async fn table_assigns_versions_regardless_of_caller() {
    let table = InMemoryFindingTable::new();
    let mut record = FindingRecord::from_finding(
        &finding("f-1"),
        RemediationStatus::NotStarted,
        fixed_now(),
        Duration::days(1),
    );
    record.version = 40;
    assert_eq!(
        table.put(record.clone(), Precondition::Absent).await.unwrap(),
        WriteOutcome::Written { version: 1 }
    );
    assert_eq!(
        table.put(record, Precondition::None).await.unwrap(),
        WriteOutcome::Written { version: 2 }
    );
    assert_eq!(table.get("f-1").await.unwrap().unwrap().version, 2);
}

fn any_status() -> impl Strategy<Value = RemediationStatus> {
    prop_oneof![
        Just(RemediationStatus::NotStarted),
        Just(RemediationStatus::InProgress),
        Just(RemediationStatus::Success),
        Just(RemediationStatus::Failed),
    ]
}

proptest! {
    #[test]
    fn reconciliation_sequences_never_return_to_not_started(
        requests in proptest::collection::vec(proptest::option::of(any_status()), 1..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = store_over(Arc::new(InMemoryFindingTable::new()));
            let finding = finding("f-prop");
            let mut advanced = false;
            for desired in requests {
                let result = store.upsert(&finding, desired, true).await;
                prop_assert_eq!(result.status, UpsertStatus::Success);
                let status = result.record.unwrap().remediation_status;
                if advanced {
                    prop_assert_ne!(status, RemediationStatus::NotStarted);
                }
                advanced |= status != RemediationStatus::NotStarted;
            }
            Ok(())
        })?;
    }
}
