//! Finding-id parsing for OCSF findings.
//!
//! Security Hub finding ids come in two mutually exclusive shapes:
//!
//! ```text
//! consolidated:   arn:<p>:securityhub:<region>:<acct>:security-control/<CONTROL>/finding/<uuid>
//! unconsolidated: arn:<p>:securityhub:<region>:<acct>:subscription/
//!                 <STANDARD>/v/<VERSION>/<CONTROL>/finding/<uuid>
//! ```
//!
//! The shapes are tried in order; the first match wins.

use std::sync::LazyLock;

use regex::Regex;

/// Which id shape matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdShape {
    /// Consolidated control findings (no standard/version segment).
    Consolidated,
    /// Per-standard control findings.
    Unconsolidated,
}

/// Parts extracted from a finding id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFindingId {
    /// Shape that matched.
    pub shape: IdShape,
    /// ARN partition (`aws`, `aws-cn`, `aws-us-gov`).
    pub partition: String,
    /// Region segment of the id.
    pub region: String,
    /// Account segment of the id.
    pub account_id: String,
    /// Standard short name; `None` for consolidated ids.
    pub standard: Option<String>,
    /// Standard version; `None` for consolidated ids.
    pub version: Option<String>,
    /// Security control id.
    pub control_id: String,
}

impl ParsedFindingId {
    /// Generator id in ASFF form.
    #[must_use]
    pub fn generator_id(&self) -> String {
        match (&self.standard, &self.version) {
            (Some(standard), Some(version)) => {
                format!("{standard}/v/{version}/{}", self.control_id)
            },
            _ => format!("security-control/{}", self.control_id),
        }
    }

    /// Standards ARN; only unconsolidated ids carry one.
    #[must_use]
    pub fn standards_arn(&self) -> Option<String> {
        let (standard, version) = (self.standard.as_ref()?, self.version.as_ref()?);
        Some(format!(
            "arn:{}:securityhub:{}::standards/{standard}/v/{version}",
            self.partition, self.region
        ))
    }

    /// Standards control ARN; only unconsolidated ids carry one.
    #[must_use]
    pub fn standards_control_arn(&self) -> Option<String> {
        let (standard, version) = (self.standard.as_ref()?, self.version.as_ref()?);
        Some(format!(
            "arn:{}:securityhub:{}:{}:control/{standard}/v/{version}/{}",
            self.partition, self.region, self.account_id, self.control_id
        ))
    }

    /// Security Hub product ARN for the id's partition and region.
    #[must_use]
    pub fn product_arn(&self) -> String {
        format!(
            "arn:{}:securityhub:{}::product/aws/securityhub",
            self.partition, self.region
        )
    }
}

static PATTERNS: LazyLock<Vec<(Regex, IdShape)>> = LazyLock::new(|| {
    [
        (
            r"^arn:(?P<partition>aws[a-z-]*):securityhub:(?P<region>[a-z0-9-]+):(?P<account>\d{12}):security-control/(?P<control>[A-Za-z0-9.\-]+)/finding/(?P<uuid>[A-Za-z0-9\-]+)$",
            IdShape::Consolidated,
        ),
        (
            r"^arn:(?P<partition>aws[a-z-]*):securityhub:(?P<region>[a-z0-9-]+):(?P<account>\d{12}):subscription/(?P<standard>[A-Za-z0-9\-]+)/v/(?P<version>\d+(?:\.\d+)*)/(?P<control>[A-Za-z0-9.\-]+)/finding/(?P<uuid>[A-Za-z0-9\-]+)$",
            IdShape::Unconsolidated,
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, shape)| Regex::new(pattern).ok().map(|re| (re, shape)))
    .collect()
});

/// Matches `finding_id` against the known shapes.
///
/// Returns `None` when neither shape matches.
#[must_use]
pub fn parse_finding_id(finding_id: &str) -> Option<ParsedFindingId> {
    PATTERNS.iter().find_map(|(re, shape)| {
        let caps = re.captures(finding_id)?;
        let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
        Some(ParsedFindingId {
            shape: *shape,
            partition: group("partition")?,
            region: group("region")?,
            account_id: group("account")?,
            standard: group("standard"),
            version: group("version"),
            control_id: group("control")?,
        })
    })
}
