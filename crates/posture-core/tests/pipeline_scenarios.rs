//! End-to-end scenarios across the event path and the reconciliation sweep,
//! sharing one state table.

use std::sync::Arc;

use posture_core::config_cache::{ConfigCache, InMemoryParameterStore};
use posture_core::filter::{FilterEngine, FilterKeys, InMemoryAccountDirectory};
use posture_core::ingestion::{
    DETAIL_TYPE_IMPORTED, InMemoryRemediationHistory, IngestionEngine, IngestionOutcome,
    MockOrchestrator,
};
use posture_core::metrics::{BestEffortMetrics, InMemoryMetricsSink};
use posture_core::remediation_config::{
    InMemoryRemediationConfigTable, RemediationConfigEntry, RemediationConfigRegistry,
};
use posture_core::state_store::{FindingStateStore, InMemoryFindingTable, RemediationStatus};
use posture_core::sweep::{InMemoryFindingSource, ReconciliationSweep};
use serde_json::{Value, json};

const ACCOUNT: &str = "111111111111";
const OCSF_ID: &str = "arn:aws:securityhub:us-east-1:111111111111:security-control/S3.1/finding/5f1c0c1e-0000-4000-8000-000000000001";

fn asff(id: &str, control: &str) -> Value {
    json!({
        "SchemaVersion": "2018-10-08",
        "Id": id,
        "ProductArn": "arn:aws:securityhub:us-east-1::product/aws/securityhub",
        "GeneratorId": format!("security-control/{control}"),
        "AwsAccountId": ACCOUNT,
        "Region": "us-east-1",
        "CreatedAt": "2024-05-01T12:00:00Z",
        "UpdatedAt": "2024-05-02T08:30:00Z",
        "Severity": { "Label": "CRITICAL", "Normalized": 90 },
        "Compliance": { "Status": "FAILED", "SecurityControlId": control },
        "Resources": [{
            "Type": "AwsS3Bucket",
            "Id": "arn:aws:s3:::bucket",
            "Tags": { "team": "a" }
        }],
        "RecordState": "ACTIVE",
        "Workflow": { "Status": "NEW" }
    })
}

fn ocsf(id: &str) -> Value {
    json!({
        "class_uid": 2003,
        "activity_id": 1,
        "status_id": 1,
        "severity": "Fatal",
        "time": 1_714_564_800_000_i64,
        "finding_info": { "uid": id, "title": "S3.1" },
        "cloud": { "account": { "uid": ACCOUNT }, "region": "us-east-1" },
        "compliance": { "status": "Fail" },
        "resources": [{ "type": "AwsS3Bucket", "uid": "bucket", "uid_alt": "arn:aws:s3:::bucket" }]
    })
}

struct Pipeline {
    engine: IngestionEngine,
    sweep: ReconciliationSweep,
    store: Arc<FindingStateStore>,
    source: Arc<InMemoryFindingSource>,
    orchestrator: Arc<MockOrchestrator>,
    sink: Arc<InMemoryMetricsSink>,
}

fn pipeline() -> Pipeline {
    let controls = Arc::new(InMemoryRemediationConfigTable::new());
    controls.upsert(RemediationConfigEntry {
        control_id: "S3.1".into(),
        supported: true,
        auto_remediation_enabled: true,
    });
    let filters = Arc::new(FilterEngine::new(
        Arc::new(ConfigCache::new(Arc::new(InMemoryParameterStore::new()))),
        Arc::new(InMemoryAccountDirectory::new()),
        FilterKeys::default(),
    ));
    let store = Arc::new(FindingStateStore::new(Arc::new(InMemoryFindingTable::new())));
    let source = Arc::new(InMemoryFindingSource::new(Vec::new()));
    let orchestrator = Arc::new(MockOrchestrator::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let metrics = BestEffortMetrics::new(sink.clone());

    let engine = IngestionEngine::new(
        Arc::new(RemediationConfigRegistry::new(controls.clone())),
        Arc::clone(&filters),
        Arc::clone(&store),
        orchestrator.clone(),
        Arc::new(InMemoryRemediationHistory::new()),
    )
    .with_metrics(metrics.clone());
    let sweep = ReconciliationSweep::new(source.clone(), controls, filters, Arc::clone(&store))
        .with_metrics(metrics);

    Pipeline {
        engine,
        sweep,
        store,
        source,
        orchestrator,
        sink,
    }
}

#[tokio::test(start_paused = true)]
async fn alternate_schema_event_triggers_and_sweep_keeps_status() {
    let p = pipeline();
    let event = json!({
        "detail-type": DETAIL_TYPE_IMPORTED,
        "detail": { "findings": [ocsf(OCSF_ID)] }
    });

    let outcomes = p.engine.process_raw_event(&event).await.unwrap();
    assert!(outcomes[0].is_triggered());
    let record = p.store.observe(OCSF_ID).await.unwrap().unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    assert_eq!(record.severity_rank, 90);

    // The upstream API now reports the same finding in canonical form.
    p.source.push(asff(OCSF_ID, "S3.1"));
    let report = p.sweep.run().await.unwrap();
    assert_eq!(report.totals.successful, 1);

    let record = p.store.observe(OCSF_ID).await.unwrap().unwrap();
    assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    assert_eq!(p.orchestrator.start_count(), 1);
    assert_eq!(p.sink.count("schema_detected"), 1);
    assert_eq!(p.sink.count("sweep_completed"), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_records_missed_findings_without_triggering() {
    let p = pipeline();
    p.source.push(asff("missed-1", "S3.1"));
    p.source.push(asff("missed-2", "S3.1"));

    let report = p.sweep.run().await.unwrap();
    assert_eq!(report.totals.successful, 2);
    assert_eq!(p.orchestrator.start_count(), 0);
    for id in ["missed-1", "missed-2"] {
        let record = p.store.observe(id).await.unwrap().unwrap();
        assert_eq!(record.remediation_status, RemediationStatus::NotStarted);
    }

    // A later event for a swept finding still triggers: no trigger is active.
    let outcome = p
        .engine
        .process(&asff("missed-1", "S3.1"), &posture_core::EventContext::imported())
        .await
        .unwrap();
    assert!(matches!(outcome, IngestionOutcome::Triggered { .. }));
}

#[tokio::test(start_paused = true)]
async fn overlapping_event_and_sweep_trigger_at_most_once() {
    let p = pipeline();
    let raw = asff("overlap", "S3.1");
    p.source.push(raw.clone());
    let context = posture_core::EventContext::imported();

    let (first, second, report) = tokio::join!(
        p.engine.process(&raw, &context),
        p.engine.process(&raw, &context),
        p.sweep.run(),
    );
    let triggered = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|o| o.is_triggered())
        .count();
    assert!(triggered <= 1);
    assert_eq!(p.orchestrator.start_count(), triggered);
    let report = report.unwrap();
    assert_eq!(report.totals.error, 0);

    let record = p.store.observe("overlap").await.unwrap().unwrap();
    if triggered == 1 {
        assert_eq!(record.remediation_status, RemediationStatus::InProgress);
    }
}
