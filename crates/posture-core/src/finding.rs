//! Canonical finding model.
//!
//! Every pipeline stage operates on [`CanonicalFinding`], which mirrors the
//! AWS Security Finding Format (ASFF). Only the fields the pipeline reads are
//! typed; everything else is carried through `extra` maps so a canonical
//! payload serializes back to the same JSON it was parsed from.
//!
//! # Invariants
//!
//! - `id` and the resolved control id are non-empty.
//! - At least one resource carries a non-empty identifier.
//!
//! Both are checked by [`CanonicalFinding::validate`], which every
//! constructor in this crate runs before handing a finding to callers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// ASFF schema version emitted for findings converted from OCSF.
pub const ASFF_SCHEMA_VERSION: &str = "2018-10-08";

/// Product-field key carrying the security control id for unconsolidated
/// findings.
pub const PRODUCT_FIELD_CONTROL_ID: &str = "ControlId";

/// Product-field key carrying the standards control ARN.
pub const PRODUCT_FIELD_STANDARDS_CONTROL_ARN: &str = "StandardsControlArn";

/// Product-field key carrying the standards ARN.
pub const PRODUCT_FIELD_STANDARDS_ARN: &str = "StandardsArn";

// =============================================================================
// Timestamps
// =============================================================================

/// A producer timestamp that serializes back exactly as it was read.
///
/// ASFF allows fractional seconds and any UTC offset; re-rendering through
/// [`DateTime`] would change the text, so the original string is kept next
/// to the parsed instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    raw: String,
    instant: DateTime<Utc>,
}

impl Timestamp {
    /// Parses an RFC 3339 timestamp, keeping `raw` verbatim.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error when `raw` is not a timestamp.
    pub fn parse(raw: impl Into<String>) -> Result<Self, chrono::ParseError> {
        let raw = raw.into();
        let instant = raw.parse::<DateTime<FixedOffset>>()?.with_timezone(&Utc);
        Ok(Self { raw, instant })
    }

    /// The parsed instant.
    #[must_use]
    pub const fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    /// The timestamp as the producer wrote it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Self {
            raw: instant.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            instant,
        }
    }
}

impl TryFrom<String> for Timestamp {
    type Error = chrono::ParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<Timestamp> for String {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.raw
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// Severity label, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLabel {
    /// No risk, informational only.
    Informational,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl SeverityLabel {
    /// Returns the ASFF label string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Informational => "INFORMATIONAL",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Returns the normalized (0-100) score that ASFF associates with the
    /// lower bound of this label.
    ///
    /// This value is also the `severity_rank` persisted on finding records
    /// and the sort key used by reconciliation queries.
    #[must_use]
    pub const fn normalized(self) -> u8 {
        match self {
            Self::Informational => 0,
            Self::Low => 1,
            Self::Medium => 40,
            Self::High => 70,
            Self::Critical => 90,
        }
    }
}

impl fmt::Display for SeverityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance status of the control evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    /// The resource passed the control.
    Passed,
    /// The result is a warning.
    Warning,
    /// The resource failed the control.
    Failed,
    /// The control could not be evaluated.
    NotAvailable,
}

impl ComplianceStatus {
    /// Returns the ASFF status string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::NotAvailable => "NOT_AVAILABLE",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record state of the finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Finding is live.
    Active,
    /// Finding was archived by its producer.
    Archived,
}

impl RecordState {
    /// Returns the ASFF record state string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow status of the finding investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Not yet reviewed.
    New,
    /// Resource owner was notified.
    Notified,
    /// Finding was resolved.
    Resolved,
    /// Finding was suppressed.
    Suppressed,
}

impl WorkflowStatus {
    /// Returns the ASFF workflow status string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Notified => "NOTIFIED",
            Self::Resolved => "RESOLVED",
            Self::Suppressed => "SUPPRESSED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Nested structures
// =============================================================================

/// Severity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Severity {
    /// Severity label.
    pub label: SeverityLabel,
    /// Normalized score (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<u8>,
    /// Unmodeled keys (`Original`, `Product`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Severity {
    /// Builds a severity block from a label, filling in the normalized score.
    #[must_use]
    pub fn from_label(label: SeverityLabel) -> Self {
        Self {
            label,
            normalized: Some(label.normalized()),
            extra: Map::new(),
        }
    }
}

/// Compliance block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Compliance {
    /// Evaluation result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ComplianceStatus>,
    /// Consolidated security control id (e.g. `S3.1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_control_id: Option<String>,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Workflow block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Workflow {
    /// Workflow status.
    pub status: WorkflowStatus,
    /// Unmodeled keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resource the finding applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    /// Resource type (e.g. `AwsS3Bucket`).
    #[serde(rename = "Type")]
    pub resource_type: String,
    /// Resource identifier, usually an ARN.
    pub id: String,
    /// Partition the resource lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Region the resource lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Resource tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    /// Unmodeled keys (`Details`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// CanonicalFinding
// =============================================================================

/// Violations of the canonical finding invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InvalidFinding {
    /// The finding id is empty.
    #[error("finding id is empty")]
    EmptyId,

    /// No control id could be resolved.
    #[error("finding {finding_id} has no resolvable control id")]
    MissingControlId {
        /// The offending finding.
        finding_id: String,
    },

    /// No resource carries an identifier.
    #[error("finding {finding_id} has no resource with an identifier")]
    NoResolvableResource {
        /// The offending finding.
        finding_id: String,
    },
}

/// The single internal finding representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CanonicalFinding {
    /// ASFF schema version.
    pub schema_version: String,
    /// Globally unique finding id.
    pub id: String,
    /// ARN of the producing product.
    pub product_arn: String,
    /// Generator id (`standard/v/version/control` or `security-control/control`).
    pub generator_id: String,
    /// Account the finding belongs to.
    pub aws_account_id: String,
    /// Region the finding was produced in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// When the finding was first created.
    pub created_at: Timestamp,
    /// When the finding was last updated by its producer.
    pub updated_at: Timestamp,
    /// Severity block.
    pub severity: Severity,
    /// Compliance block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<Compliance>,
    /// Producer specific string fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_fields: Option<BTreeMap<String, String>>,
    /// Affected resources, in producer order.
    pub resources: Vec<Resource>,
    /// Record state; absent means `ACTIVE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_state: Option<RecordState>,
    /// Workflow block; absent means `NEW`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Workflow>,
    /// Every other top-level ASFF key (`Title`, `Description`, `Types`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalFinding {
    /// Parses a canonical (ASFF) payload and checks the invariants.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalParseError::Structure`] when the payload does not
    /// have the ASFF shape and [`CanonicalParseError::Invalid`] when it does
    /// but violates an invariant.
    pub fn from_canonical(raw: &Value) -> Result<Self, CanonicalParseError> {
        let finding = Self::deserialize(raw).map_err(CanonicalParseError::Structure)?;
        finding.validate()?;
        Ok(finding)
    }

    /// Serializes the finding back to its ASFF JSON form.
    ///
    /// # Errors
    ///
    /// Fails only if a carried-through `extra` value cannot be represented,
    /// which cannot happen for values that came from JSON.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Checks the canonical invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), InvalidFinding> {
        if self.id.trim().is_empty() {
            return Err(InvalidFinding::EmptyId);
        }
        if self.control_id().is_empty() {
            return Err(InvalidFinding::MissingControlId {
                finding_id: self.id.clone(),
            });
        }
        if self.primary_resource_id().is_none() {
            return Err(InvalidFinding::NoResolvableResource {
                finding_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Returns the security control id.
    ///
    /// Resolution order: `Compliance.SecurityControlId`, then
    /// `ProductFields.ControlId`, then the last segment of `GeneratorId`.
    /// Returns an empty string only for findings that failed validation.
    #[must_use]
    pub fn control_id(&self) -> &str {
        if let Some(id) = self
            .compliance
            .as_ref()
            .and_then(|c| c.security_control_id.as_deref())
            .filter(|id| !id.is_empty())
        {
            return id;
        }
        if let Some(id) = self
            .product_fields
            .as_ref()
            .and_then(|fields| fields.get(PRODUCT_FIELD_CONTROL_ID))
            .filter(|id| !id.is_empty())
        {
            return id;
        }
        self.generator_id.rsplit('/').next().unwrap_or_default()
    }

    /// Account id the finding belongs to.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.aws_account_id
    }

    /// Region of the finding, falling back to the first resource region.
    #[must_use]
    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .or_else(|| self.resources.iter().find_map(|r| r.region.as_deref()))
            .unwrap_or_default()
    }

    /// Severity label.
    #[must_use]
    pub const fn severity_label(&self) -> SeverityLabel {
        self.severity.label
    }

    /// Normalized severity, derived from the label when the producer omitted
    /// it.
    #[must_use]
    pub fn severity_normalized(&self) -> u8 {
        self.severity
            .normalized
            .unwrap_or_else(|| self.severity.label.normalized())
    }

    /// Compliance status; absent means `NOT_AVAILABLE`.
    #[must_use]
    pub fn compliance_status(&self) -> ComplianceStatus {
        self.compliance
            .as_ref()
            .and_then(|c| c.status)
            .unwrap_or(ComplianceStatus::NotAvailable)
    }

    /// Record state; absent means `ACTIVE`.
    #[must_use]
    pub fn record_state(&self) -> RecordState {
        self.record_state.unwrap_or(RecordState::Active)
    }

    /// Workflow status; absent means `NEW`.
    #[must_use]
    pub fn workflow_status(&self) -> WorkflowStatus {
        self.workflow
            .as_ref()
            .map_or(WorkflowStatus::New, |w| w.status)
    }

    /// Overwrites the workflow status, keeping any other workflow keys.
    pub fn set_workflow_status(&mut self, status: WorkflowStatus) {
        match &mut self.workflow {
            Some(workflow) => workflow.status = status,
            None => {
                self.workflow = Some(Workflow {
                    status,
                    extra: Map::new(),
                });
            },
        }
    }

    /// Identifier of the first resource that has one.
    #[must_use]
    pub fn primary_resource_id(&self) -> Option<&str> {
        self.resources
            .iter()
            .map(|r| r.id.as_str())
            .find(|id| !id.trim().is_empty())
    }

    /// Type of the first resource.
    #[must_use]
    pub fn primary_resource_type(&self) -> Option<&str> {
        self.resources.first().map(|r| r.resource_type.as_str())
    }

    /// Union of tag keys across all resources, sorted and deduplicated.
    #[must_use]
    pub fn tag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .resources
            .iter()
            .filter_map(|r| r.tags.as_ref())
            .flat_map(|tags| tags.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Errors from [`CanonicalFinding::from_canonical`].
#[derive(Debug, Error)]
pub enum CanonicalParseError {
    /// The payload does not have the ASFF structure.
    #[error("payload is not an ASFF finding: {0}")]
    Structure(#[source] serde_json::Error),

    /// The payload is ASFF but violates an invariant.
    #[error(transparent)]
    Invalid(#[from] InvalidFinding),
}


#[cfg(test)]
mod tests {
    use super::fixtures::asff;
    use super::*;

    #[test]
    fn timestamp_keeps_text_and_parses_instant() {
        let stamp = Timestamp::parse("2024-05-01T14:00:00.250+02:00").unwrap();
        assert_eq!(stamp.as_str(), "2024-05-01T14:00:00.250+02:00");
        assert_eq!(stamp.to_string(), "2024-05-01T14:00:00.250+02:00");
        assert_eq!(stamp.instant().timestamp_millis(), 1_714_564_800_250);
        assert!(Timestamp::parse("yesterday").is_err());

        let converted = Timestamp::from(stamp.instant());
        assert_eq!(converted.as_str(), "2024-05-01T12:00:00.250Z");
    }

    #[test]
    fn canonical_roundtrip_preserves_unmodeled_keys() {
        let raw = asff("finding-1", "S3.1", "111111111111");
        let finding = CanonicalFinding::from_canonical(&raw).unwrap();
        assert_eq!(finding.to_value().unwrap(), raw);
        assert_eq!(finding.extra["Title"], "S3.1 should be remediated");
    }

    #[test]
    fn control_id_resolution_order() {
        let mut raw = asff("finding-1", "S3.1", "111111111111");
        raw["Compliance"] = serde_json::json!({ "Status": "FAILED" });
        raw["ProductFields"] = serde_json::json!({ "ControlId": "S3.2" });
        let finding = CanonicalFinding::from_canonical(&raw).unwrap();
        assert_eq!(finding.control_id(), "S3.2");

        raw.as_object_mut().unwrap().remove("ProductFields");
        let finding = CanonicalFinding::from_canonical(&raw).unwrap();
        assert_eq!(finding.control_id(), "S3.1");
    }

    #[test]
    fn empty_id_is_rejected() {
        let raw = asff("", "S3.1", "111111111111");
        assert!(matches!(
            CanonicalFinding::from_canonical(&raw),
            Err(CanonicalParseError::Invalid(InvalidFinding::EmptyId))
        ));
    }

    #[test]
    fn resource_without_identifier_is_rejected() {
        let mut raw = asff("finding-1", "S3.1", "111111111111");
        raw["Resources"][0]["Id"] = Value::String(String::new());
        assert!(matches!(
            CanonicalFinding::from_canonical(&raw),
            Err(CanonicalParseError::Invalid(
                InvalidFinding::NoResolvableResource { .. }
            ))
        ));
    }

    #[test]
    fn defaults_for_absent_blocks() {
        let mut raw = asff("finding-1", "S3.1", "111111111111");
        let obj = raw.as_object_mut().unwrap();
        obj.remove("RecordState");
        obj.remove("Workflow");
        let mut finding = CanonicalFinding::from_canonical(&raw).unwrap();
        assert_eq!(finding.record_state(), RecordState::Active);
        assert_eq!(finding.workflow_status(), WorkflowStatus::New);

        finding.set_workflow_status(WorkflowStatus::Notified);
        assert_eq!(finding.workflow_status(), WorkflowStatus::Notified);
    }

    #[test]
    fn severity_labels_are_ordered() {
        assert!(SeverityLabel::Informational < SeverityLabel::Low);
        assert!(SeverityLabel::Low < SeverityLabel::Medium);
        assert!(SeverityLabel::Medium < SeverityLabel::High);
        assert!(SeverityLabel::High < SeverityLabel::Critical);
    }

    #[test]
    fn tag_keys_are_unioned_across_resources() {
        let mut raw = asff("finding-1", "S3.1", "111111111111");
        raw["Resources"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({
                "Type": "AwsS3Bucket",
                "Id": "arn:aws:s3:::other",
                "Tags": { "owner": "team-a", "env": "dev" }
            }));
        let finding = CanonicalFinding::from_canonical(&raw).unwrap();
        assert_eq!(finding.tag_keys(), vec!["env".to_string(), "owner".to_string()]);
    }
}
