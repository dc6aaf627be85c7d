//! Schema detection and normalization.
//!
//! Raw findings arrive in one of two wire formats:
//!
//! | Schema | Role | Detection |
//! |--------|------|-----------|
//! | ASFF   | canonical | deserializes as [`CanonicalFinding`] and passes its invariants |
//! | OCSF   | alternate | deserializes as an OCSF Compliance Finding (`class_uid = 2003`) |
//!
//! ASFF input is returned as-is. OCSF input is mapped field by field; the
//! mapping tables live in [`ocsf`](self) and are exercised by this module's
//! tests.
//!
//! Detection emits a best-effort [`PipelineMetric::SchemaDetected`].

mod id_pattern;
mod ocsf;

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use id_pattern::{IdShape, ParsedFindingId, parse_finding_id};
pub use ocsf::{ACTIVITY_ARCHIVED, COMPLIANCE_FINDING_CLASS_UID, STATUS_ARCHIVED};

use crate::finding::{CanonicalFinding, CanonicalParseError, InvalidFinding};
use crate::metrics::{BestEffortMetrics, PipelineMetric};

/// Wire schema a raw finding was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindingSchema {
    /// AWS Security Finding Format (canonical).
    Asff,
    /// Open Cybersecurity Schema Framework compliance finding.
    Ocsf,
}

impl FindingSchema {
    /// Label value used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asff => "asff",
            Self::Ocsf => "ocsf",
        }
    }
}

impl fmt::Display for FindingSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalization failures. All of them are permanent for the input.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NormalizeError {
    /// The payload matches neither supported schema.
    #[error("unrecognized finding schema (asff: {asff}; ocsf: {ocsf})")]
    UnrecognizedSchema {
        /// Why ASFF validation failed.
        asff: String,
        /// Why OCSF validation failed.
        ocsf: String,
    },

    /// The OCSF finding id matches neither known id shape.
    #[error("cannot extract standard and control from finding id {finding_id}")]
    StandardIdParse {
        /// The unparseable id.
        finding_id: String,
    },

    /// A resource carries no usable identifier.
    #[error("resource {index} has no alternate id, id or name")]
    MalformedResource {
        /// Position of the resource in the input.
        index: usize,
    },

    /// A timestamp is outside the representable range.
    #[error("{field} is not a valid epoch-millisecond timestamp: {millis}")]
    InvalidTimestamp {
        /// Source field.
        field: &'static str,
        /// The offending value.
        millis: i64,
    },

    /// The mapped finding violates a canonical invariant.
    #[error(transparent)]
    InvalidFinding(#[from] InvalidFinding),
}

impl NormalizeError {
    /// Short machine-readable reason used as a metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::UnrecognizedSchema { .. } => "unrecognized_schema",
            Self::StandardIdParse { .. } => "standard_id_parse",
            Self::MalformedResource { .. } => "malformed_resource",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::InvalidFinding(_) => "invalid_finding",
        }
    }
}

/// Converts raw findings into [`CanonicalFinding`]s.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    metrics: BestEffortMetrics,
}

impl SchemaNormalizer {
    /// Creates a normalizer reporting schema usage to `metrics`.
    #[must_use]
    pub const fn new(metrics: BestEffortMetrics) -> Self {
        Self { metrics }
    }

    /// Detects the schema of `raw` and returns the canonical finding.
    ///
    /// # Errors
    ///
    /// - [`NormalizeError::UnrecognizedSchema`] when `raw` validates against
    ///   neither schema.
    /// - [`NormalizeError::StandardIdParse`], [`NormalizeError::MalformedResource`],
    ///   [`NormalizeError::InvalidTimestamp`] when `raw` is OCSF but cannot be
    ///   mapped.
    pub fn normalize(&self, raw: &Value) -> Result<CanonicalFinding, NormalizeError> {
        let (finding, schema) = detect_and_convert(raw)?;
        debug!(finding_id = %finding.id, schema = %schema, "finding normalized");
        self.metrics.record(PipelineMetric::SchemaDetected { schema });
        Ok(finding)
    }
}

fn detect_and_convert(raw: &Value) -> Result<(CanonicalFinding, FindingSchema), NormalizeError> {
    let asff_failure = match CanonicalFinding::from_canonical(raw) {
        Ok(finding) => return Ok((finding, FindingSchema::Asff)),
        Err(CanonicalParseError::Structure(e)) => e.to_string(),
        // ASFF-shaped input that breaks an invariant is not retried as OCSF.
        Err(CanonicalParseError::Invalid(e)) => return Err(e.into()),
    };

    let ocsf_failure = match ocsf::OcsfFinding::deserialize(raw) {
        Ok(finding) if finding.is_compliance_finding() => {
            return finding.into_canonical().map(|f| (f, FindingSchema::Ocsf));
        },
        Ok(_) => format!(
            "class_uid is not {}",
            ocsf::COMPLIANCE_FINDING_CLASS_UID
        ),
        Err(e) => e.to_string(),
    };

    Err(NormalizeError::UnrecognizedSchema {
        asff: asff_failure,
        ocsf: ocsf_failure,
    })
}
