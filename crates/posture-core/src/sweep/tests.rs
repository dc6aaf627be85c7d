//! Reconciliation sweep tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::config_cache::{ConfigCache, InMemoryParameterStore};
use crate::filter::{FilterKeys, InMemoryAccountDirectory};
use crate::finding::fixtures::asff;
use crate::metrics::InMemoryMetricsSink;
use crate::remediation_config::{InMemoryRemediationConfigTable, RemediationConfigEntry};
use crate::state_store::{
    FindingRecord, FindingTable, InMemoryFindingTable, Precondition, RemediationStatus, StoreError,
    WriteOutcome,
};

const ACCOUNT: &str = "111111111111";

// =============================================================================
// Helpers
// =============================================================================

fn controls(ids: &[&str]) -> Arc<InMemoryRemediationConfigTable> {
    let table = InMemoryRemediationConfigTable::new();
    for id in ids {
        table.upsert(RemediationConfigEntry {
            control_id: (*id).to_string(),
            supported: true,
            auto_remediation_enabled: true,
        });
    }
    Arc::new(table)
}

fn filters(params: &[(&str, &str)]) -> Arc<FilterEngine> {
    let keys = FilterKeys::default();
    let store = Arc::new(InMemoryParameterStore::new());
    for (leaf, value) in params {
        store.put(format!("{}{leaf}", keys.prefix), *value);
    }
    Arc::new(FilterEngine::new(
        Arc::new(ConfigCache::new(store)),
        Arc::new(InMemoryAccountDirectory::new()),
        keys,
    ))
}

fn findings(count: usize, control: &str) -> Vec<Value> {
    (0..count)
        .map(|i| asff(&format!("{control}-finding-{i}"), control, ACCOUNT))
        .collect()
}

fn sweep_over(
    source: Arc<dyn FindingSource>,
    table: Arc<dyn FindingTable>,
    control_ids: &[&str],
) -> (ReconciliationSweep, Arc<FindingStateStore>) {
    let store = Arc::new(FindingStateStore::new(table));
    let sweep = ReconciliationSweep::new(
        source,
        controls(control_ids),
        filters(&[]),
        Arc::clone(&store),
    );
    (sweep, store)
}

/// Records every query and serves a fixed list of pages.
struct ScriptedSource {
    pages: Vec<Result<FindingPage, String>>,
    queries: Mutex<Vec<FindingQuery>>,
}

impl ScriptedSource {
    fn new(pages: Vec<Result<FindingPage, String>>) -> Self {
        Self {
            pages,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn queries(&self) -> Vec<FindingQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl FindingSource for ScriptedSource {
    async fn get_findings(&self, query: &FindingQuery) -> Result<FindingPage, SourceError> {
        let mut queries = self.queries.lock().unwrap();
        let call = queries.len();
        queries.push(query.clone());
        match self.pages.get(call) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(message)) => Err(SourceError::Unavailable(message.clone())),
            None => Ok(FindingPage::default()),
        }
    }
}

struct FaultyTable {
    writes: AtomicUsize,
}

#[async_trait]
impl FindingTable for FaultyTable {
    async fn get(&self, _finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        Ok(None)
    }

    async fn put(
        &self,
        _record: FindingRecord,
        _precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            Err(StoreError::Unavailable("throttled".into()))
        } else {
            Ok(WriteOutcome::Written { version: 1 })
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

#[test]
fn counters_total_and_effectiveness() {
    let counters = SweepCounters {
        successful: 6,
        failed: 1,
        error: 1,
        filtered: 2,
    };
    assert_eq!(counters.total(), 10);
    assert!((counters.filter_effectiveness() - 0.2).abs() < f64::EPSILON);
    assert!(SweepCounters::default().filter_effectiveness().abs() < f64::EPSILON);
}

#[test]
fn default_config() {
    let config = SweepConfig::default();
    assert_eq!(config.chunk_size, 20);
    assert_eq!(config.page_size, 100);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.page_delay, Duration::from_millis(120));
    assert!(config.standard_prefixes.contains(&"security-control/".to_string()));
}

// =============================================================================
// Sweep
// =============================================================================

#[tokio::test(start_paused = true)]
async fn pagination_terminates_after_source_pages() {
    let source = Arc::new(InMemoryFindingSource::new(findings(250, "S3.1")));
    let (sweep, store) =
        sweep_over(source.clone(), Arc::new(InMemoryFindingTable::new()), &["S3.1"]);

    let started = tokio::time::Instant::now();
    let report = sweep.run().await.unwrap();

    assert_eq!(source.calls(), 3);
    assert_eq!(report.pages, 3);
    assert_eq!(report.totals.total(), 250);
    assert_eq!(report.totals.successful, 250);
    assert_eq!(report.chunks.len(), 1);
    assert_eq!(report.chunks[0].pages, 3);
    assert!(store.observe("S3.1-finding-249").await.unwrap().is_some());

    // Two pages carried a continuation token.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(240), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(360), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn empty_token_ends_pagination() {
    let source = Arc::new(ScriptedSource::new(vec![Ok(FindingPage {
        findings: findings(2, "S3.1"),
        next_token: Some(String::new()),
    })]));
    let (sweep, _) = sweep_over(source.clone(), Arc::new(InMemoryFindingTable::new()), &["S3.1"]);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.pages, 1);
    assert_eq!(source.queries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn controls_are_queried_in_chunks() {
    let ids: Vec<String> = (0..45).map(|i| format!("C.{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let source = Arc::new(ScriptedSource::new(Vec::new()));
    let (sweep, _) = sweep_over(source.clone(), Arc::new(InMemoryFindingTable::new()), &id_refs);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.chunks.len(), 3);
    let sizes: Vec<_> = source
        .queries()
        .iter()
        .map(|q| q.filters[&QueryField::ComplianceSecurityControlId].len())
        .collect();
    assert_eq!(sizes, vec![20, 20, 5]);

    let query = &source.queries()[0];
    assert_eq!(query.max_results, 100);
    assert_eq!(
        query.sort,
        vec![
            SortCriterion {
                field: SortField::SeverityNormalized,
                order: SortOrder::Desc
            },
            SortCriterion {
                field: SortField::UpdatedAt,
                order: SortOrder::Desc
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn only_matching_findings_are_reconciled() {
    let mut passed = asff("passed", "S3.1", ACCOUNT);
    passed["Compliance"]["Status"] = json!("PASSED");
    let mut archived = asff("archived", "S3.1", ACCOUNT);
    archived["RecordState"] = json!("ARCHIVED");
    let unsupported = asff("unsupported", "IAM.99", ACCOUNT);
    let failing = asff("failing", "S3.1", ACCOUNT);

    let source = Arc::new(InMemoryFindingSource::new(vec![passed, archived, unsupported, failing]));
    let (sweep, store) = sweep_over(source, Arc::new(InMemoryFindingTable::new()), &["S3.1"]);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.totals.total(), 1);
    assert!(store.observe("failing").await.unwrap().is_some());
    assert!(store.observe("passed").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn per_finding_errors_do_not_abort_the_sweep() {
    let mut page = findings(3, "S3.1");
    page.insert(1, json!({"Id": "broken"}));
    let source = Arc::new(ScriptedSource::new(vec![Ok(FindingPage {
        findings: page,
        next_token: None,
    })]));
    let (sweep, _) = sweep_over(source, Arc::new(InMemoryFindingTable::new()), &["S3.1"]);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.totals.successful, 3);
    assert_eq!(report.totals.error, 1);
}

#[tokio::test(start_paused = true)]
async fn store_faults_are_counted_per_finding() {
    let source = Arc::new(InMemoryFindingSource::new(findings(4, "S3.1")));
    let table = Arc::new(FaultyTable {
        writes: AtomicUsize::new(0),
    });
    let (sweep, _) = sweep_over(source, table, &["S3.1"]);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.totals.error, 2);
    assert_eq!(report.totals.successful, 2);
}

#[tokio::test(start_paused = true)]
async fn filtered_findings_are_counted() {
    let source = Arc::new(InMemoryFindingSource::new(findings(4, "S3.1")));
    let store = Arc::new(FindingStateStore::new(Arc::new(InMemoryFindingTable::new())));
    let sink = Arc::new(InMemoryMetricsSink::new());
    let sweep = ReconciliationSweep::new(
        source,
        controls(&["S3.1"]),
        filters(&[("TagFilters", "env"), ("TagFilterMode", "Exclude")]),
        store,
    )
    .with_metrics(BestEffortMetrics::new(sink.clone()));

    let report = sweep.run().await.unwrap();
    assert_eq!(report.totals.filtered, 4);
    assert!((report.filter_effectiveness - 1.0).abs() < f64::EPSILON);
    assert_eq!(sink.count("sweep_completed"), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_does_not_regress_in_progress_records() {
    let table = Arc::new(InMemoryFindingTable::new());
    let source = Arc::new(InMemoryFindingSource::new(findings(1, "S3.1")));
    let (sweep, store) = sweep_over(source, table, &["S3.1"]);

    let finding =
        CanonicalFinding::from_canonical(&asff("S3.1-finding-0", "S3.1", ACCOUNT)).unwrap();
    store
        .upsert(&finding, Some(RemediationStatus::InProgress), false)
        .await;

    let report = sweep.run().await.unwrap();
    assert_eq!(report.totals.successful, 1);
    let record = store.observe("S3.1-finding-0").await.unwrap().unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    assert_eq!(record.version, 2);
}

#[tokio::test(start_paused = true)]
async fn source_failure_aborts_with_partial_counters() {
    let source = Arc::new(ScriptedSource::new(vec![
        Ok(FindingPage {
            findings: findings(3, "S3.1"),
            next_token: Some("page-2".into()),
        }),
        Err("connection reset".into()),
    ]));
    let store = Arc::new(FindingStateStore::new(Arc::new(InMemoryFindingTable::new())));
    let sink = Arc::new(InMemoryMetricsSink::new());
    let sweep = ReconciliationSweep::new(source.clone(), controls(&["S3.1"]), filters(&[]), store)
        .with_metrics(BestEffortMetrics::new(sink.clone()));

    let err = sweep.run().await.unwrap_err();
    assert!(matches!(err, SweepError::Source(SourceError::Unavailable(_))));
    assert_eq!(source.queries()[1].next_token.as_deref(), Some("page-2"));

    let recorded = sink.recorded();
    let failed = recorded
        .iter()
        .find_map(|m| match m {
            PipelineMetric::SweepFailed { counters } => Some(*counters),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed.successful, 3);
    assert_eq!(sink.count("sweep_completed"), 0);
}
