//! OCSF compliance-finding model and its mapping onto ASFF.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::NormalizeError;
use super::id_pattern::{IdShape, parse_finding_id};
use crate::finding::{
    ASFF_SCHEMA_VERSION, CanonicalFinding, Compliance, ComplianceStatus,
    PRODUCT_FIELD_CONTROL_ID, PRODUCT_FIELD_STANDARDS_ARN, PRODUCT_FIELD_STANDARDS_CONTROL_ARN,
    RecordState, Resource, Severity, SeverityLabel, Workflow, WorkflowStatus,
};

/// OCSF class uid of the Compliance Finding class.
pub const COMPLIANCE_FINDING_CLASS_UID: u32 = 2003;

/// Activity id OCSF uses for archived findings.
pub const ACTIVITY_ARCHIVED: i64 = 3;

/// Status id OCSF uses for archived findings.
pub const STATUS_ARCHIVED: i64 = 5;

#[derive(Debug, Deserialize)]
pub(super) struct OcsfFinding {
    class_uid: u32,
    #[serde(default)]
    activity_id: Option<i64>,
    #[serde(default)]
    status_id: Option<i64>,
    #[serde(default)]
    severity: Option<String>,
    time: i64,
    finding_info: FindingInfo,
    cloud: Cloud,
    #[serde(default)]
    compliance: Option<OcsfCompliance>,
    resources: Vec<OcsfResource>,
}

#[derive(Debug, Deserialize)]
struct FindingInfo {
    uid: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    created_time: Option<i64>,
    #[serde(default)]
    modified_time: Option<i64>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Cloud {
    account: Account,
    region: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct OcsfCompliance {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcsfResource {
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    uid_alt: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    value: String,
}

impl OcsfFinding {
    /// Structural validation beyond what serde enforces.
    pub(super) fn is_compliance_finding(&self) -> bool {
        self.class_uid == COMPLIANCE_FINDING_CLASS_UID
    }

    /// Maps this finding onto the canonical model.
    pub(super) fn into_canonical(self) -> Result<CanonicalFinding, NormalizeError> {
        let parsed = parse_finding_id(&self.finding_info.uid).ok_or_else(|| {
            NormalizeError::StandardIdParse {
                finding_id: self.finding_info.uid.clone(),
            }
        })?;

        let created_at = millis_to_utc(
            "finding_info.created_time",
            self.finding_info.created_time.unwrap_or(self.time),
        )?;
        let updated_at = millis_to_utc(
            "finding_info.modified_time",
            self.finding_info.modified_time.unwrap_or(self.time),
        )?;

        let mut product_fields = BTreeMap::new();
        product_fields.insert(PRODUCT_FIELD_CONTROL_ID.to_string(), parsed.control_id.clone());
        if parsed.shape == IdShape::Unconsolidated {
            if let Some(arn) = parsed.standards_control_arn() {
                product_fields.insert(PRODUCT_FIELD_STANDARDS_CONTROL_ARN.to_string(), arn);
            }
            if let Some(arn) = parsed.standards_arn() {
                product_fields.insert(PRODUCT_FIELD_STANDARDS_ARN.to_string(), arn);
            }
        }

        let resources = self
            .resources
            .into_iter()
            .enumerate()
            .map(|(index, r)| map_resource(index, r, &parsed.partition))
            .collect::<Result<Vec<_>, _>>()?;
        if resources.is_empty() {
            return Err(NormalizeError::MalformedResource { index: 0 });
        }

        let mut extra = Map::new();
        if let Some(title) = self.finding_info.title {
            extra.insert("Title".into(), Value::String(title));
        }
        if let Some(desc) = self.finding_info.desc {
            extra.insert("Description".into(), Value::String(desc));
        }
        if !self.finding_info.types.is_empty() {
            extra.insert(
                "Types".into(),
                Value::Array(self.finding_info.types.into_iter().map(Value::String).collect()),
            );
        }

        let finding = CanonicalFinding {
            schema_version: ASFF_SCHEMA_VERSION.to_string(),
            product_arn: parsed.product_arn(),
            generator_id: parsed.generator_id(),
            aws_account_id: self.cloud.account.uid,
            region: Some(self.cloud.region),
            created_at: created_at.into(),
            updated_at: updated_at.into(),
            severity: Severity::from_label(map_severity(self.severity.as_deref())),
            compliance: Some(Compliance {
                status: Some(map_compliance_status(
                    self.compliance.as_ref().and_then(|c| c.status.as_deref()),
                )),
                security_control_id: Some(parsed.control_id),
                extra: Map::new(),
            }),
            product_fields: Some(product_fields),
            resources,
            record_state: Some(map_record_state(self.activity_id, self.status_id)),
            workflow: Some(Workflow {
                status: map_workflow_status(self.status_id),
                extra: Map::new(),
            }),
            id: self.finding_info.uid,
            extra,
        };
        finding.validate()?;
        Ok(finding)
    }
}

fn millis_to_utc(field: &'static str, millis: i64) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(NormalizeError::InvalidTimestamp { field, millis })
}

fn map_resource(
    index: usize,
    resource: OcsfResource,
    partition: &str,
) -> Result<Resource, NormalizeError> {
    let id = resolve_resource_id(&resource).ok_or(NormalizeError::MalformedResource { index })?;
    let tags: BTreeMap<String, String> = resource
        .tags
        .into_iter()
        .map(|tag| (tag.name, tag.value))
        .collect();
    Ok(Resource {
        resource_type: resource.resource_type.unwrap_or_else(|| "Other".to_string()),
        id,
        partition: Some(partition.to_string()),
        region: resource.region,
        tags: (!tags.is_empty()).then_some(tags),
        extra: Map::new(),
    })
}

/// Resource identity priority: ARN-shaped `uid_alt`, then `uid`, then `name`.
fn resolve_resource_id(resource: &OcsfResource) -> Option<String> {
    let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
    non_empty(&resource.uid_alt)
        .filter(|alt| is_arn(alt))
        .or_else(|| non_empty(&resource.uid))
        .or_else(|| non_empty(&resource.name))
}

/// `arn:partition:service:region:account:resource`, region and account may be
/// empty.
pub(super) fn is_arn(value: &str) -> bool {
    let mut parts = value.splitn(6, ':');
    parts.next() == Some("arn")
        && parts.next().is_some_and(|p| !p.is_empty())
        && parts.next().is_some_and(|s| !s.is_empty())
        && parts.next().is_some()
        && parts.next().is_some()
        && parts.next().is_some_and(|r| !r.is_empty())
}

/// Case-insensitive severity table; `fatal` collapses onto `CRITICAL`.
pub(super) fn map_severity(raw: Option<&str>) -> SeverityLabel {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("low") => SeverityLabel::Low,
        Some("medium") => SeverityLabel::Medium,
        Some("high") => SeverityLabel::High,
        Some("critical" | "fatal") => SeverityLabel::Critical,
        _ => SeverityLabel::Informational,
    }
}

pub(super) fn map_compliance_status(raw: Option<&str>) -> ComplianceStatus {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("pass") => ComplianceStatus::Passed,
        Some("fail") => ComplianceStatus::Failed,
        Some("warning") => ComplianceStatus::Warning,
        _ => ComplianceStatus::NotAvailable,
    }
}

pub(super) fn map_record_state(activity_id: Option<i64>, status_id: Option<i64>) -> RecordState {
    if activity_id == Some(ACTIVITY_ARCHIVED) || status_id == Some(STATUS_ARCHIVED) {
        RecordState::Archived
    } else {
        RecordState::Active
    }
}

pub(super) fn map_workflow_status(status_id: Option<i64>) -> WorkflowStatus {
    match status_id {
        None | Some(0 | 1) => WorkflowStatus::New,
        Some(2) => WorkflowStatus::Notified,
        Some(3) => WorkflowStatus::Suppressed,
        Some(_) => WorkflowStatus::Resolved,
    }
}
