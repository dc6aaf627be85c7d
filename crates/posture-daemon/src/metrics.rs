//! Prometheus export of pipeline metrics.
//!
//! [`PipelineMetrics`] implements the core [`MetricsSink`], so the ingestion
//! engine and the sweep report into Prometheus through the same best-effort
//! path they use everywhere else.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `posture_schema_detected_total` | Counter | `schema` |
//! | `posture_normalization_failures_total` | Counter | `reason` |
//! | `posture_findings_filtered_total` | Counter | `axis` |
//! | `posture_remediations_triggered_total` | Counter | `control_id` |
//! | `posture_sweeps_total` | Counter | `result` |
//! | `posture_last_sweep_findings` | Gauge | `outcome` |
//! | `posture_last_sweep_filter_effectiveness` | Gauge | |

use std::sync::Arc;

use posture_core::metrics::{MetricsError, MetricsSink, PipelineMetric};
use posture_core::sweep::SweepCounters;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Maximum length for label values to prevent unbounded label cardinality.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics setup or export.
#[derive(Debug, Error)]
pub enum PrometheusError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type PrometheusResult<T> = Result<T, PrometheusError>;

/// Pipeline metrics registered with a Prometheus registry.
#[derive(Clone)]
pub struct PipelineMetrics {
    schema_detected_total: CounterVec,
    normalization_failures_total: CounterVec,
    findings_filtered_total: CounterVec,
    remediations_triggered_total: CounterVec,
    sweeps_total: CounterVec,
    last_sweep_findings: GaugeVec,
    last_sweep_filter_effectiveness: Gauge,
}

impl PipelineMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> PrometheusResult<Self> {
        let schema_detected_total = CounterVec::new(
            Opts::new(
                "posture_schema_detected_total",
                "Raw findings recognised per wire schema",
            ),
            &["schema"],
        )?;
        registry.register(Box::new(schema_detected_total.clone()))?;

        let normalization_failures_total = CounterVec::new(
            Opts::new(
                "posture_normalization_failures_total",
                "Raw findings dropped because they could not be normalized",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(normalization_failures_total.clone()))?;

        let findings_filtered_total = CounterVec::new(
            Opts::new(
                "posture_findings_filtered_total",
                "Findings rejected by a filter axis",
            ),
            &["axis"],
        )?;
        registry.register(Box::new(findings_filtered_total.clone()))?;

        let remediations_triggered_total = CounterVec::new(
            Opts::new(
                "posture_remediations_triggered_total",
                "Remediations started, by control",
            ),
            &["control_id"],
        )?;
        registry.register(Box::new(remediations_triggered_total.clone()))?;

        let sweeps_total = CounterVec::new(
            Opts::new("posture_sweeps_total", "Reconciliation sweeps by result"),
            &["result"],
        )?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let last_sweep_findings = GaugeVec::new(
            Opts::new(
                "posture_last_sweep_findings",
                "Findings processed by the most recent sweep, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(last_sweep_findings.clone()))?;

        let last_sweep_filter_effectiveness = Gauge::new(
            "posture_last_sweep_filter_effectiveness",
            "Share of findings filtered in the most recent completed sweep",
        )?;
        registry.register(Box::new(last_sweep_filter_effectiveness.clone()))?;

        Ok(Self {
            schema_detected_total,
            normalization_failures_total,
            findings_filtered_total,
            remediations_triggered_total,
            sweeps_total,
            last_sweep_findings,
            last_sweep_filter_effectiveness,
        })
    }

    fn inc(counter: &CounterVec, label: &str) -> Result<(), MetricsError> {
        counter
            .get_metric_with_label_values(&[truncate_label(label)])
            .map_err(|e| MetricsError::Delivery(e.to_string()))?
            .inc();
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_sweep_findings(&self, counters: &SweepCounters) -> Result<(), MetricsError> {
        for (outcome, value) in [
            ("successful", counters.successful),
            ("failed", counters.failed),
            ("error", counters.error),
            ("filtered", counters.filtered),
        ] {
            self.last_sweep_findings
                .get_metric_with_label_values(&[outcome])
                .map_err(|e| MetricsError::Delivery(e.to_string()))?
                .set(value as f64);
        }
        Ok(())
    }

    /// Remediations triggered for `control_id`. Used by tests.
    #[must_use]
    pub fn triggered_count(&self, control_id: &str) -> f64 {
        self.remediations_triggered_total
            .with_label_values(&[truncate_label(control_id)])
            .get()
    }

    /// Sweeps finished with `result` (`completed` or `failed`). Used by tests.
    #[must_use]
    pub fn sweep_count(&self, result: &str) -> f64 {
        self.sweeps_total.with_label_values(&[result]).get()
    }

    /// Findings filtered on `axis`. Used by tests.
    #[must_use]
    pub fn filtered_count(&self, axis: &str) -> f64 {
        self.findings_filtered_total.with_label_values(&[axis]).get()
    }
}

impl MetricsSink for PipelineMetrics {
    fn emit(&self, metric: &PipelineMetric) -> Result<(), MetricsError> {
        match metric {
            PipelineMetric::SchemaDetected { schema } => {
                Self::inc(&self.schema_detected_total, schema.as_str())
            },
            PipelineMetric::NormalizationFailed { reason } => {
                Self::inc(&self.normalization_failures_total, reason)
            },
            PipelineMetric::FindingFiltered { axis } => {
                Self::inc(&self.findings_filtered_total, axis.as_str())
            },
            PipelineMetric::RemediationTriggered { control_id } => {
                Self::inc(&self.remediations_triggered_total, control_id)
            },
            PipelineMetric::SweepCompleted {
                counters,
                filter_effectiveness,
            } => {
                Self::inc(&self.sweeps_total, "completed")?;
                self.set_sweep_findings(counters)?;
                self.last_sweep_filter_effectiveness
                    .set(*filter_effectiveness);
                Ok(())
            },
            PipelineMetric::SweepFailed { counters } => {
                Self::inc(&self.sweeps_total, "failed")?;
                self.set_sweep_findings(counters)
            },
        }
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

/// Holds the Prometheus registry and the pipeline metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pipeline_metrics: PipelineMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all pipeline metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> PrometheusResult<Self> {
        let registry = Registry::new();
        let pipeline_metrics = PipelineMetrics::new(&registry)?;
        Ok(Self {
            registry,
            pipeline_metrics,
        })
    }

    /// Returns the pipeline metrics.
    #[must_use]
    pub const fn pipeline_metrics(&self) -> &PipelineMetrics {
        &self.pipeline_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> PrometheusResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PrometheusError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| PrometheusError::EncodingFailed(e.to_string()))
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

/// Shared metrics registry handle.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> PrometheusResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value at a UTF-8 boundary at or before
/// [`MAX_LABEL_VALUE_LEN`] bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
