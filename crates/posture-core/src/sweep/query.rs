//! Finding source queries.
//!
//! A [`FindingQuery`] mirrors the upstream finding API: string filters
//! grouped by field, sort criteria, a page size and an opaque continuation
//! token. Within a field, `Equals` and `Prefix` filters are alternatives and
//! `NotEquals` filters must all hold; across fields every group must hold.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::finding::{CanonicalFinding, ComplianceStatus, RecordState};

/// Fields a query can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryField {
    /// `RecordState`.
    RecordState,
    /// `Compliance.Status`.
    ComplianceStatus,
    /// `GeneratorId`.
    GeneratorId,
    /// `Compliance.SecurityControlId`, resolved like the pipeline does.
    ComplianceSecurityControlId,
}

impl QueryField {
    fn value_of(self, finding: &CanonicalFinding) -> String {
        match self {
            Self::RecordState => finding.record_state().as_str().to_string(),
            Self::ComplianceStatus => finding.compliance_status().as_str().to_string(),
            Self::GeneratorId => finding.generator_id.clone(),
            Self::ComplianceSecurityControlId => finding.control_id().to_string(),
        }
    }
}

/// String comparison of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// Exact match.
    Equals,
    /// Anything but an exact match.
    NotEquals,
    /// Starts with.
    Prefix,
}

/// One `(comparison, value)` filter on a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringFilter {
    /// Comparison.
    pub comparison: Comparison,
    /// Operand.
    pub value: String,
}

impl StringFilter {
    fn test(&self, candidate: &str) -> bool {
        match self.comparison {
            Comparison::Equals => candidate == self.value,
            Comparison::NotEquals => candidate != self.value,
            Comparison::Prefix => candidate.starts_with(&self.value),
        }
    }
}

/// Sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    /// `Severity.Normalized`.
    SeverityNormalized,
    /// `UpdatedAt`.
    UpdatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One sort key and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortCriterion {
    /// Key.
    pub field: SortField,
    /// Direction.
    pub order: SortOrder,
}

/// A paginated finding query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FindingQuery {
    /// Filters grouped by field.
    pub filters: BTreeMap<QueryField, Vec<StringFilter>>,
    /// Sort criteria, most significant first.
    pub sort: Vec<SortCriterion>,
    /// Page size.
    pub max_results: usize,
    /// Continuation token from the previous page.
    pub next_token: Option<String>,
}

impl FindingQuery {
    /// Creates an unfiltered query returning `max_results` per page.
    #[must_use]
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            ..Self::default()
        }
    }

    /// Adds a filter.
    #[must_use]
    pub fn filter(
        mut self,
        field: QueryField,
        comparison: Comparison,
        value: impl Into<String>,
    ) -> Self {
        self.filters.entry(field).or_default().push(StringFilter {
            comparison,
            value: value.into(),
        });
        self
    }

    /// Appends a sort criterion.
    #[must_use]
    pub fn sort_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort.push(SortCriterion { field, order });
        self
    }

    /// The reconciliation query for one chunk of control ids: active,
    /// non-passing findings from supported standards, most severe and most
    /// recently updated first.
    #[must_use]
    pub fn reconciliation(
        control_ids: &[String],
        standard_prefixes: &[String],
        page_size: usize,
    ) -> Self {
        let mut query = Self::new(page_size)
            .filter(QueryField::RecordState, Comparison::Equals, RecordState::Active.as_str())
            .filter(
                QueryField::ComplianceStatus,
                Comparison::NotEquals,
                ComplianceStatus::Passed.as_str(),
            )
            .filter(
                QueryField::ComplianceStatus,
                Comparison::NotEquals,
                ComplianceStatus::NotAvailable.as_str(),
            );
        for prefix in standard_prefixes {
            query = query.filter(QueryField::GeneratorId, Comparison::Prefix, prefix.as_str());
        }
        for control_id in control_ids {
            query = query.filter(
                QueryField::ComplianceSecurityControlId,
                Comparison::Equals,
                control_id.as_str(),
            );
        }
        query
            .sort_by(SortField::SeverityNormalized, SortOrder::Desc)
            .sort_by(SortField::UpdatedAt, SortOrder::Desc)
    }

    /// Returns a copy positioned at `token`.
    #[must_use]
    pub fn at_page(&self, token: Option<String>) -> Self {
        Self {
            next_token: token,
            ..self.clone()
        }
    }

    /// Evaluates the filters against a finding.
    #[must_use]
    pub fn matches(&self, finding: &CanonicalFinding) -> bool {
        self.filters.iter().all(|(field, filters)| {
            let candidate = field.value_of(finding);
            let (negative, positive): (Vec<_>, Vec<_>) = filters
                .iter()
                .partition(|f| f.comparison == Comparison::NotEquals);
            negative.iter().all(|f| f.test(&candidate))
                && (positive.is_empty() || positive.iter().any(|f| f.test(&candidate)))
        })
    }

    /// Orders two findings by the sort criteria.
    #[must_use]
    pub fn compare(&self, a: &CanonicalFinding, b: &CanonicalFinding) -> Ordering {
        self.sort.iter().fold(Ordering::Equal, |acc, criterion| {
            acc.then_with(|| {
                let ord = match criterion.field {
                    SortField::SeverityNormalized => {
                        a.severity_normalized().cmp(&b.severity_normalized())
                    },
                    SortField::UpdatedAt => a.updated_at.instant().cmp(&b.updated_at.instant()),
                };
                match criterion.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            })
        })
    }
}

// =============================================================================
// Source
// =============================================================================

/// One page of raw findings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindingPage {
    /// Findings in canonical form, not yet validated.
    pub findings: Vec<Value>,
    /// Token for the next page; `None` (or empty) on the last page.
    pub next_token: Option<String>,
}

/// Finding source errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The source could not be reached.
    #[error("finding source unavailable: {0}")]
    Unavailable(String),

    /// The continuation token was not issued by this source.
    #[error("invalid continuation token {0:?}")]
    InvalidToken(String),

    /// The source data could not be read.
    #[error("finding source data unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// Paginated upstream finding API.
#[async_trait]
pub trait FindingSource: Send + Sync {
    /// Returns one page of findings matching `query`.
    async fn get_findings(&self, query: &FindingQuery) -> Result<FindingPage, SourceError>;
}

/// Evaluates `query` over `findings` and returns the requested page.
///
/// Tokens are decimal offsets into the filtered, sorted result. Entries that
/// are not valid canonical findings never match.
///
/// # Errors
///
/// Returns [`SourceError::InvalidToken`] for a token that is not an offset.
pub fn paginate(findings: &[Value], query: &FindingQuery) -> Result<FindingPage, SourceError> {
    let offset = match query.next_token.as_deref() {
        None | Some("") => 0,
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| SourceError::InvalidToken(token.to_string()))?,
    };

    let mut matched: Vec<(CanonicalFinding, &Value)> = findings
        .iter()
        .filter_map(|raw| match CanonicalFinding::from_canonical(raw) {
            Ok(finding) => Some((finding, raw)),
            Err(e) => {
                debug!(error = %e, "skipping unreadable source entry");
                None
            },
        })
        .filter(|(finding, _)| query.matches(finding))
        .collect();
    matched.sort_by(|(a, _), (b, _)| query.compare(a, b));

    let page_size = query.max_results.max(1);
    let end = offset.saturating_add(page_size).min(matched.len());
    let page = matched
        .get(offset..end)
        .unwrap_or_default()
        .iter()
        .map(|(_, raw)| (*raw).clone())
        .collect();
    let next_token = (end < matched.len()).then(|| end.to_string());
    Ok(FindingPage {
        findings: page,
        next_token,
    })
}

/// Source over findings held in memory.
#[derive(Debug, Default)]
pub struct InMemoryFindingSource {
    findings: RwLock<Vec<Value>>,
    calls: AtomicUsize,
}

impl InMemoryFindingSource {
    /// Creates a source over `findings`.
    #[must_use]
    pub fn new(findings: Vec<Value>) -> Self {
        Self {
            findings: RwLock::new(findings),
            calls: AtomicUsize::new(0),
        }
    }

    /// Adds a finding.
    pub fn push(&self, finding: Value) {
        self.findings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(finding);
    }

    /// Number of `get_findings` calls served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl FindingSource for InMemoryFindingSource {
    async fn get_findings(&self, query: &FindingQuery) -> Result<FindingPage, SourceError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let findings = self
            .findings
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        paginate(&findings, query)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::finding::fixtures::asff;

    fn finding(id: &str, control: &str) -> CanonicalFinding {
        CanonicalFinding::from_canonical(&asff(id, control, "111111111111")).unwrap()
    }

    fn prefixes() -> Vec<String> {
        vec!["security-control/".to_string()]
    }

    #[test]
    fn reconciliation_query_matches_failing_active_findings() {
        let controls = ["S3.1".to_string(), "S3.2".to_string()];
        let query = FindingQuery::reconciliation(&controls, &prefixes(), 100);
        assert!(query.matches(&finding("a", "S3.1")));
        assert!(query.matches(&finding("b", "S3.2")));
        assert!(!query.matches(&finding("c", "EC2.1")));
    }

    #[test]
    fn not_equals_filters_all_hold() {
        let query = FindingQuery::reconciliation(&["S3.1".to_string()], &prefixes(), 100);
        for status in ["PASSED", "NOT_AVAILABLE"] {
            let mut raw = asff("a", "S3.1", "111111111111");
            raw["Compliance"]["Status"] = json!(status);
            let finding = CanonicalFinding::from_canonical(&raw).unwrap();
            assert!(!query.matches(&finding), "{status}");
        }
        let mut raw = asff("a", "S3.1", "111111111111");
        raw["Compliance"]["Status"] = json!("WARNING");
        assert!(query.matches(&CanonicalFinding::from_canonical(&raw).unwrap()));
    }

    #[test]
    fn archived_and_foreign_standards_do_not_match() {
        let query = FindingQuery::reconciliation(&["S3.1".to_string()], &prefixes(), 100);
        let mut archived = asff("a", "S3.1", "111111111111");
        archived["RecordState"] = json!("ARCHIVED");
        assert!(!query.matches(&CanonicalFinding::from_canonical(&archived).unwrap()));

        let mut foreign = asff("b", "S3.1", "111111111111");
        foreign["GeneratorId"] = json!("custom-standard/S3.1");
        assert!(!query.matches(&CanonicalFinding::from_canonical(&foreign).unwrap()));
    }

    #[test]
    fn sorting_prefers_severity_then_recency() {
        let mut low = asff("low", "S3.1", "111111111111");
        low["Severity"] = json!({"Label": "LOW", "Normalized": 1});
        let mut old_critical = asff("old", "S3.1", "111111111111");
        old_critical["Severity"] = json!({"Label": "CRITICAL", "Normalized": 90});
        old_critical["UpdatedAt"] = json!("2024-01-01T00:00:00Z");
        let mut new_critical = asff("new", "S3.1", "111111111111");
        new_critical["Severity"] = json!({"Label": "CRITICAL", "Normalized": 90});
        new_critical["UpdatedAt"] = json!("2024-06-01T00:00:00Z");

        let query = FindingQuery::reconciliation(&["S3.1".to_string()], &prefixes(), 10);
        let page = paginate(&[low, old_critical, new_critical], &query).unwrap();
        let ids: Vec<_> = page
            .findings
            .iter()
            .map(|f| f["Id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["new", "old", "low"]);
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn pagination_tokens_are_offsets() {
        let findings: Vec<_> = (0..5)
            .map(|i| asff(&format!("f-{i}"), "S3.1", "111111111111"))
            .collect();
        let query = FindingQuery::new(2);
        let first = paginate(&findings, &query).unwrap();
        assert_eq!(first.findings.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));
        let last = paginate(&findings, &query.at_page(Some("4".into()))).unwrap();
        assert_eq!(last.findings.len(), 1);
        assert_eq!(last.next_token, None);

        assert!(matches!(
            paginate(&findings, &query.at_page(Some("abc".into()))),
            Err(SourceError::InvalidToken(_))
        ));
    }
}
