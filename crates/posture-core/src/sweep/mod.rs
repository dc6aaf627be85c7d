//! Scheduled reconciliation of stored state against the finding source.
//!
//! A sweep catches findings whose events were never delivered and refreshes
//! records for everything still failing. It never invokes the orchestrator;
//! it only filters and upserts with reconciliation semantics, so status never
//! moves backwards.
//!
//! # Algorithm
//!
//! 1. List supported control ids and split them into chunks
//!    ([`SweepConfig::chunk_size`]) so each query stays within filter limits.
//! 2. Query each chunk with [`FindingQuery::reconciliation`].
//! 3. Page through results ([`SweepConfig::page_size`]), sleeping
//!    [`SweepConfig::page_delay`] after every page that has a continuation
//!    token.
//! 4. Reconcile each page in concurrent batches ([`SweepConfig::batch_size`]).
//!    Per-finding failures are counted, never propagated.
//! 5. Aggregate per-chunk and grand-total counters.
//! 6. A failure listing controls or fetching a page aborts the sweep after
//!    emitting [`PipelineMetric::SweepFailed`] with the partial totals.

mod query;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use query::{
    Comparison, FindingPage, FindingQuery, FindingSource, InMemoryFindingSource, QueryField,
    SortCriterion, SortField, SortOrder, SourceError, StringFilter, paginate,
};

use crate::filter::FilterEngine;
use crate::finding::CanonicalFinding;
use crate::metrics::{BestEffortMetrics, PipelineMetric};
use crate::remediation_config::{
    RemediationConfigError, RemediationConfigTable, supported_control_ids,
};
use crate::state_store::{FindingStateStore, UpsertStatus};

/// Default control ids per query.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Default findings per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default findings reconciled concurrently.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default pause between pages.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(120);

/// Generator id prefixes of the standards the sweep covers.
pub const DEFAULT_STANDARD_PREFIXES: [&str; 6] = [
    "aws-foundational-security-best-practices/v/1.0.0",
    "cis-aws-foundations-benchmark/v/1.2.0",
    "cis-aws-foundations-benchmark/v/1.4.0",
    "pci-dss/v/3.2.1",
    "nist-800-53/v/5.0.0",
    "security-control/",
];

/// Sweep tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Control ids per query.
    pub chunk_size: usize,
    /// Findings per page.
    pub page_size: usize,
    /// Findings reconciled concurrently.
    pub batch_size: usize,
    /// Pause after each page that has a continuation token.
    pub page_delay: Duration,
    /// Generator id prefixes to include.
    pub standard_prefixes: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            page_delay: DEFAULT_PAGE_DELAY,
            standard_prefixes: DEFAULT_STANDARD_PREFIXES.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Reconciliation tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepCounters {
    /// Records written.
    pub successful: usize,
    /// Writes that lost to a concurrent writer.
    pub failed: usize,
    /// Findings that could not be read or written.
    pub error: usize,
    /// Findings rejected by a filter.
    pub filtered: usize,
}

impl SweepCounters {
    /// Findings processed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.successful + self.failed + self.error + self.filtered
    }

    /// `filtered / total`, zero when nothing was processed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn filter_effectiveness(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.filtered as f64 / total as f64,
        }
    }

    fn add(&mut self, other: &Self) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.error += other.error;
        self.filtered += other.filtered;
    }

    fn tally(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Successful => self.successful += 1,
            ReconcileOutcome::Failed => self.failed += 1,
            ReconcileOutcome::Error => self.error += 1,
            ReconcileOutcome::Filtered => self.filtered += 1,
        }
    }
}

/// Results for one chunk of control ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkReport {
    /// Control ids queried.
    pub control_ids: Vec<String>,
    /// Tallies for this chunk.
    pub counters: SweepCounters,
    /// Pages fetched.
    pub pages: usize,
}

/// Results of a sweep.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepReport {
    /// Per-chunk results, in query order.
    pub chunks: Vec<ChunkReport>,
    /// Grand totals.
    pub totals: SweepCounters,
    /// Pages fetched across all chunks.
    pub pages: usize,
    /// `filtered / total` over the whole sweep.
    pub filter_effectiveness: f64,
}

/// Failures that abort a sweep.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SweepError {
    /// Supported controls could not be listed.
    #[error("listing supported controls failed: {0}")]
    ControlListing(#[from] RemediationConfigError),

    /// A page could not be fetched.
    #[error("fetching findings failed: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileOutcome {
    Successful,
    Failed,
    Error,
    Filtered,
}

/// One reconciliation pass.
pub struct ReconciliationSweep {
    source: Arc<dyn FindingSource>,
    controls: Arc<dyn RemediationConfigTable>,
    filters: Arc<FilterEngine>,
    store: Arc<FindingStateStore>,
    metrics: BestEffortMetrics,
    config: SweepConfig,
}

impl ReconciliationSweep {
    /// Creates a sweep with default tuning and metrics disabled.
    #[must_use]
    pub fn new(
        source: Arc<dyn FindingSource>,
        controls: Arc<dyn RemediationConfigTable>,
        filters: Arc<FilterEngine>,
        store: Arc<FindingStateStore>,
    ) -> Self {
        Self {
            source,
            controls,
            filters,
            store,
            metrics: BestEffortMetrics::disabled(),
            config: SweepConfig::default(),
        }
    }

    /// Replaces the tuning.
    #[must_use]
    pub fn with_config(mut self, config: SweepConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes pipeline metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: BestEffortMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current tuning.
    #[must_use]
    pub const fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Runs one full sweep.
    ///
    /// # Errors
    ///
    /// Returns [`SweepError`] when controls cannot be listed or a page cannot
    /// be fetched. Per-finding failures are counted in the report instead.
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();
        match self.run_chunks(&mut report).await {
            Ok(()) => {
                report.filter_effectiveness = report.totals.filter_effectiveness();
                info!(
                    chunks = report.chunks.len(),
                    pages = report.pages,
                    successful = report.totals.successful,
                    failed = report.totals.failed,
                    error = report.totals.error,
                    filtered = report.totals.filtered,
                    filter_effectiveness = report.filter_effectiveness,
                    "reconciliation sweep completed"
                );
                self.metrics.record(PipelineMetric::SweepCompleted {
                    counters: report.totals,
                    filter_effectiveness: report.filter_effectiveness,
                });
                Ok(report)
            },
            Err(e) => {
                error!(
                    error = %e,
                    pages = report.pages,
                    processed = report.totals.total(),
                    "reconciliation sweep failed"
                );
                self.metrics.record(PipelineMetric::SweepFailed {
                    counters: report.totals,
                });
                Err(e)
            },
        }
    }

    async fn run_chunks(&self, report: &mut SweepReport) -> Result<(), SweepError> {
        let control_ids = supported_control_ids(self.controls.as_ref()).await?;
        debug!(controls = control_ids.len(), "supported controls listed");
        for chunk in control_ids.chunks(self.config.chunk_size.max(1)) {
            self.sweep_chunk(chunk, report).await?;
        }
        Ok(())
    }

    async fn sweep_chunk(
        &self,
        control_ids: &[String],
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let index = report.chunks.len();
        report.chunks.push(ChunkReport {
            control_ids: control_ids.to_vec(),
            ..ChunkReport::default()
        });
        let base = FindingQuery::reconciliation(
            control_ids,
            &self.config.standard_prefixes,
            self.config.page_size,
        );

        let mut token: Option<String> = None;
        loop {
            let page = self.source.get_findings(&base.at_page(token.take())).await?;
            let counters = self.reconcile_page(&page.findings).await;

            let chunk = &mut report.chunks[index];
            chunk.pages += 1;
            chunk.counters.add(&counters);
            report.pages += 1;
            report.totals.add(&counters);

            match page.next_token {
                Some(next) if !next.is_empty() => {
                    token = Some(next);
                    tokio::time::sleep(self.config.page_delay).await;
                },
                _ => break,
            }
        }
        debug!(
            chunk = index,
            pages = report.chunks[index].pages,
            processed = report.chunks[index].counters.total(),
            "chunk reconciled"
        );
        Ok(())
    }

    async fn reconcile_page(&self, findings: &[Value]) -> SweepCounters {
        let mut counters = SweepCounters::default();
        for batch in findings.chunks(self.config.batch_size.max(1)) {
            for outcome in join_all(batch.iter().map(|raw| self.reconcile_one(raw))).await {
                counters.tally(outcome);
            }
        }
        counters
    }

    async fn reconcile_one(&self, raw: &Value) -> ReconcileOutcome {
        let finding = match CanonicalFinding::from_canonical(raw) {
            Ok(finding) => finding,
            Err(e) => {
                warn!(error = %e, "unreadable finding in source page");
                return ReconcileOutcome::Error;
            },
        };
        if !self.filters.apply_all(&finding).await.passed {
            return ReconcileOutcome::Filtered;
        }
        match self.store.upsert(&finding, None, true).await.status {
            UpsertStatus::Success => ReconcileOutcome::Successful,
            UpsertStatus::Failed => ReconcileOutcome::Failed,
            UpsertStatus::Error => ReconcileOutcome::Error,
        }
    }
}

impl std::fmt::Debug for ReconciliationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationSweep")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
