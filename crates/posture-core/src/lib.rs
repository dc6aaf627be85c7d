//! # posture-core
//!
//! Ingestion and reconciliation of security posture findings for automated
//! remediation.
//!
//! Findings arrive two ways: as delivered events (one or more raw findings
//! per event) and through a scheduled sweep over the upstream finding API.
//! Both paths converge on the same normalized model and the same per-finding
//! state table, and the state table alone decides who may trigger a
//! remediation.
//!
//! ## Pipeline
//!
//! ```text
//! raw finding --> SchemaNormalizer --> RemediationConfigLookup --> FilterEngine
//!                                                                      |
//!                     orchestrator <-- IngestionEngine <-- FindingStateStore
//!                                                                      ^
//!   finding source --> ReconciliationSweep --> FilterEngine -----------+
//! ```
//!
//! ## Modules
//!
//! - [`finding`]: the canonical finding model
//! - [`normalize`]: schema detection and alternate-schema mapping
//! - [`config_cache`]: read-through cache over the configuration store
//! - [`filter`]: account, account-hierarchy and tag filters
//! - [`remediation_config`]: per-control remediation settings
//! - [`state_store`]: per-finding state with conditional writes
//! - [`ingestion`]: the event-path decision engine
//! - [`sweep`]: scheduled reconciliation
//! - [`metrics`]: best-effort pipeline metrics
//!
//! Every external system sits behind a trait with an in-memory
//! implementation here; production backends live in `posture-daemon`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use posture_core::config_cache::{ConfigCache, InMemoryParameterStore};
//! use posture_core::filter::{FilterEngine, FilterKeys, InMemoryAccountDirectory};
//! use posture_core::ingestion::{
//!     EventContext, InMemoryRemediationHistory, IngestionEngine, MockOrchestrator,
//! };
//! use posture_core::remediation_config::{
//!     InMemoryRemediationConfigTable, RemediationConfigEntry, RemediationConfigRegistry,
//! };
//! use posture_core::state_store::{FindingStateStore, InMemoryFindingTable};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let controls = InMemoryRemediationConfigTable::new();
//! controls.upsert(RemediationConfigEntry {
//!     control_id: "S3.1".into(),
//!     supported: true,
//!     auto_remediation_enabled: true,
//! });
//!
//! let filters = FilterEngine::new(
//!     Arc::new(ConfigCache::new(Arc::new(InMemoryParameterStore::new()))),
//!     Arc::new(InMemoryAccountDirectory::new()),
//!     FilterKeys::default(),
//! );
//! let orchestrator = Arc::new(MockOrchestrator::new());
//! let engine = IngestionEngine::new(
//!     Arc::new(RemediationConfigRegistry::new(Arc::new(controls))),
//!     Arc::new(filters),
//!     Arc::new(FindingStateStore::new(Arc::new(InMemoryFindingTable::new()))),
//!     orchestrator.clone(),
//!     Arc::new(InMemoryRemediationHistory::new()),
//! );
//!
//! let raw = serde_json::json!({
//!     "SchemaVersion": "2018-10-08",
//!     "Id": "finding-1",
//!     "ProductArn": "arn:aws:securityhub:us-east-1::product/aws/securityhub",
//!     "GeneratorId": "security-control/S3.1",
//!     "AwsAccountId": "111111111111",
//!     "CreatedAt": "2024-05-01T12:00:00Z",
//!     "UpdatedAt": "2024-05-01T12:00:00Z",
//!     "Severity": { "Label": "HIGH" },
//!     "Compliance": { "Status": "FAILED", "SecurityControlId": "S3.1" },
//!     "Resources": [{ "Type": "AwsS3Bucket", "Id": "arn:aws:s3:::bucket" }]
//! });
//! let outcome = engine.process(&raw, &EventContext::imported()).await.unwrap();
//! assert!(outcome.is_triggered());
//! assert_eq!(orchestrator.start_count(), 1);
//! # });
//! ```

pub mod config_cache;
pub mod filter;
pub mod finding;
pub mod ingestion;
pub mod metrics;
pub mod normalize;
pub mod remediation_config;
pub mod state_store;
pub mod sweep;

pub use finding::CanonicalFinding;
pub use ingestion::{EventContext, FindingEvent, IngestionEngine, IngestionError, IngestionOutcome};
pub use metrics::{BestEffortMetrics, MetricsSink, PipelineMetric};
pub use normalize::{NormalizeError, SchemaNormalizer};
pub use state_store::{FindingRecord, FindingStateStore, RemediationStatus};
pub use sweep::{ReconciliationSweep, SweepConfig, SweepError, SweepReport};
