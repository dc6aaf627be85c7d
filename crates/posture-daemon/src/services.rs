//! Wiring of the core pipeline from [`DaemonConfig`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use posture_core::config_cache::{ConfigCache, InMemoryParameterStore};
use posture_core::filter::{FilterEngine, InMemoryAccountDirectory};
use posture_core::ingestion::{IngestionEngine, RemediationOrchestrator};
use posture_core::metrics::BestEffortMetrics;
use posture_core::remediation_config::{InMemoryRemediationConfigTable, RemediationConfigRegistry};
use posture_core::state_store::{FindingRecord, FindingStateStore};
use posture_core::{IngestionOutcome, ReconciliationSweep, SweepReport};
use tracing::{info, warn};

use crate::backends::{CommandOrchestrator, NdjsonFindingSource, read_ndjson};
use crate::config::DaemonConfig;
use crate::metrics::{SharedMetricsRegistry, new_shared_registry};
use crate::store::{SqliteFindingTable, SqliteRemediationHistory, open_database};

/// Tally of an ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Events read.
    pub events: usize,
    /// Findings per outcome kind.
    pub outcomes: BTreeMap<&'static str, usize>,
    /// Events that failed and would need redelivery.
    pub failed_events: usize,
}

impl IngestSummary {
    fn record(&mut self, outcomes: &[IngestionOutcome]) {
        for outcome in outcomes {
            *self.outcomes.entry(outcome.kind()).or_default() += 1;
        }
    }

    /// Findings that triggered a remediation.
    #[must_use]
    pub fn triggered(&self) -> usize {
        self.outcomes.get("triggered").copied().unwrap_or(0)
    }
}

/// The assembled pipeline.
pub struct Services {
    engine: Option<IngestionEngine>,
    sweep: Option<ReconciliationSweep>,
    store: Arc<FindingStateStore>,
    findings: Arc<SqliteFindingTable>,
    history: Arc<SqliteRemediationHistory>,
    filters: Arc<FilterEngine>,
    remediation: Arc<RemediationConfigRegistry>,
    metrics: Option<SharedMetricsRegistry>,
}

impl Services {
    /// Builds the pipeline, starting remediations with the configured
    /// command when one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or metrics cannot
    /// be registered.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let orchestrator = config.orchestrator.command.as_ref().map(|command| {
            Arc::new(CommandOrchestrator::new(
                command.clone(),
                config.orchestrator.args.clone(),
            )) as Arc<dyn RemediationOrchestrator>
        });
        Self::build(config, orchestrator)
    }

    /// Builds the pipeline with an explicit orchestrator.
    ///
    /// Without an orchestrator the event path is unavailable; without
    /// `source.export_path` the sweep is.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or metrics cannot
    /// be registered.
    pub fn build(
        config: &DaemonConfig,
        orchestrator: Option<Arc<dyn RemediationOrchestrator>>,
    ) -> Result<Self> {
        let conn = open_database(&config.store.db_path).with_context(|| {
            format!(
                "failed to open state database {}",
                config.store.db_path.display()
            )
        })?;
        let findings = Arc::new(SqliteFindingTable::new(Arc::clone(&conn)));
        let history = Arc::new(SqliteRemediationHistory::new(conn));
        let store = Arc::new(
            FindingStateStore::new(findings.clone()).with_retention(config.store.retention()),
        );

        let parameters = InMemoryParameterStore::with_values(config.parameters.clone());
        let directory = InMemoryAccountDirectory::new();
        for (account, parents) in &config.accounts {
            directory.insert(account.clone(), parents.clone());
        }
        let filters = Arc::new(FilterEngine::new(
            Arc::new(ConfigCache::new(Arc::new(parameters))),
            Arc::new(directory),
            config.filter_keys(),
        ));

        let controls = Arc::new(InMemoryRemediationConfigTable::new());
        for entry in &config.controls {
            controls.upsert(entry.clone());
        }
        let remediation = Arc::new(RemediationConfigRegistry::new(controls.clone()));

        let (metrics, pipeline_metrics) = if config.metrics.enabled {
            let registry = new_shared_registry().context("failed to register metrics")?;
            let sink = BestEffortMetrics::new(Arc::new(registry.pipeline_metrics().clone()));
            (Some(registry), sink)
        } else {
            (None, BestEffortMetrics::disabled())
        };

        let engine = orchestrator.map(|orchestrator| {
            IngestionEngine::new(
                Arc::clone(&remediation),
                Arc::clone(&filters),
                Arc::clone(&store),
                orchestrator,
                history.clone(),
            )
            .with_metrics(pipeline_metrics.clone())
        });
        let sweep = config.source.export_path.as_ref().map(|path| {
            ReconciliationSweep::new(
                Arc::new(NdjsonFindingSource::new(path.clone())),
                controls,
                Arc::clone(&filters),
                Arc::clone(&store),
            )
            .with_config(config.sweep.to_sweep_config())
            .with_metrics(pipeline_metrics.clone())
        });

        info!(
            db_path = %config.store.db_path.display(),
            controls = config.controls.len(),
            event_path = engine.is_some(),
            sweep = sweep.is_some(),
            metrics = metrics.is_some(),
            "pipeline assembled"
        );

        Ok(Self {
            engine,
            sweep,
            store,
            findings,
            history,
            filters,
            remediation,
            metrics,
        })
    }

    /// The event-path engine.
    ///
    /// # Errors
    ///
    /// Returns an error when no orchestrator command is configured.
    pub fn engine(&self) -> Result<&IngestionEngine> {
        self.engine
            .as_ref()
            .ok_or_else(|| anyhow!("orchestrator.command is not configured"))
    }

    /// The reconciliation sweep.
    ///
    /// # Errors
    ///
    /// Returns an error when no finding export is configured.
    pub fn sweep(&self) -> Result<&ReconciliationSweep> {
        self.sweep
            .as_ref()
            .ok_or_else(|| anyhow!("source.export_path is not configured"))
    }

    /// Prometheus registry, when metrics are enabled.
    #[must_use]
    pub const fn metrics(&self) -> Option<&SharedMetricsRegistry> {
        self.metrics.as_ref()
    }

    /// Processes every event in an NDJSON file.
    ///
    /// Failed events are logged and counted; processing continues with the
    /// next event.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is unavailable or the file cannot be
    /// read.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestSummary> {
        let engine = self.engine()?;
        let events = read_ndjson(path)
            .await
            .with_context(|| format!("failed to read events from {}", path.display()))?;

        let mut summary = IngestSummary::default();
        for event in &events {
            summary.events += 1;
            match engine.process_raw_event(event).await {
                Ok(outcomes) => summary.record(&outcomes),
                Err(e) => {
                    summary.failed_events += 1;
                    warn!(error = %e, retryable = e.is_retryable(), "event processing failed");
                },
            }
        }
        info!(
            events = summary.events,
            triggered = summary.triggered(),
            failed_events = summary.failed_events,
            "ingest finished"
        );
        Ok(summary)
    }

    /// Runs one sweep with fresh configuration, then purges expired records.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep is unavailable or aborts.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let sweep = self.sweep()?;
        self.refresh().await;
        let report = sweep.run().await.context("reconciliation sweep failed")?;
        match self.findings.purge_expired(Utc::now()).await {
            Ok(purged) if purged > 0 => info!(purged, "expired records purged"),
            Ok(_) => {},
            Err(e) => warn!(error = %e, "purging expired records failed"),
        }
        Ok(report)
    }

    /// Drops cached configuration so the next read goes to the source.
    pub async fn refresh(&self) {
        self.filters.invalidate_all().await;
        self.remediation.invalidate_all();
    }

    /// Current state of one finding with its remediation history.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails.
    pub async fn describe(
        &self,
        finding_id: &str,
    ) -> Result<(Option<FindingRecord>, Vec<posture_core::ingestion::RemediationHistoryEntry>)>
    {
        let record = self.store.observe(finding_id).await?;
        let history = self.history.entries_for(finding_id).await?;
        Ok((record, history))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("event_path", &self.engine.is_some())
            .field("sweep", &self.sweep.is_some())
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}
