//! Best-effort pipeline metrics.
//!
//! The pipeline reports what it did through [`PipelineMetric`] values handed
//! to a [`MetricsSink`]. Sinks may fail (a collector is down, a label is
//! rejected); [`BestEffortMetrics`] is the only emission path used by the
//! pipeline and swallows those failures after logging them, so metric
//! delivery never changes control flow.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use crate::filter::FilterAxis;
use crate::normalize::FindingSchema;
use crate::sweep::SweepCounters;

/// Errors a metrics sink may report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// The sink could not deliver the metric.
    #[error("metric delivery failed: {0}")]
    Delivery(String),
}

/// A single pipeline observation.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMetric {
    /// A raw finding was recognised as the given wire schema.
    SchemaDetected {
        /// Detected schema.
        schema: FindingSchema,
    },
    /// A raw finding was dropped because it could not be normalized.
    NormalizationFailed {
        /// Short machine-readable reason.
        reason: &'static str,
    },
    /// A finding was dropped by a configured filter.
    FindingFiltered {
        /// The axis that rejected it.
        axis: FilterAxis,
    },
    /// The remediation orchestrator was invoked.
    RemediationTriggered {
        /// Control the remediation is for.
        control_id: String,
    },
    /// A reconciliation sweep finished.
    SweepCompleted {
        /// Grand totals.
        counters: SweepCounters,
        /// `filtered / total`, zero when nothing was processed.
        filter_effectiveness: f64,
    },
    /// A reconciliation sweep aborted.
    SweepFailed {
        /// Totals accumulated before the failure.
        counters: SweepCounters,
    },
}

impl PipelineMetric {
    /// Stable metric name, used for logging and as the Prometheus label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SchemaDetected { .. } => "schema_detected",
            Self::NormalizationFailed { .. } => "normalization_failed",
            Self::FindingFiltered { .. } => "finding_filtered",
            Self::RemediationTriggered { .. } => "remediation_triggered",
            Self::SweepCompleted { .. } => "sweep_completed",
            Self::SweepFailed { .. } => "sweep_failed",
        }
    }
}

/// Destination for pipeline metrics.
pub trait MetricsSink: Send + Sync {
    /// Delivers one metric.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails. Callers never propagate it.
    fn emit(&self, metric: &PipelineMetric) -> Result<(), MetricsError>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn emit(&self, _metric: &PipelineMetric) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Sink that keeps every metric in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    recorded: Mutex<Vec<PipelineMetric>>,
}

impl InMemoryMetricsSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn recorded(&self) -> Vec<PipelineMetric> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded metrics with the given name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|m| m.name() == name)
            .count()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn emit(&self, metric: &PipelineMetric) -> Result<(), MetricsError> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(metric.clone());
        Ok(())
    }
}

/// Failure-isolating wrapper around a [`MetricsSink`].
#[derive(Clone)]
pub struct BestEffortMetrics {
    sink: Arc<dyn MetricsSink>,
}

impl BestEffortMetrics {
    /// Wraps a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    /// Metrics that go nowhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopMetricsSink))
    }

    /// Emits a metric, logging and discarding any delivery failure.
    pub fn record(&self, metric: PipelineMetric) {
        if let Err(e) = self.sink.emit(&metric) {
            warn!(metric = metric.name(), error = %e, "metric delivery failed");
        }
    }
}

impl std::fmt::Debug for BestEffortMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestEffortMetrics").finish_non_exhaustive()
    }
}
