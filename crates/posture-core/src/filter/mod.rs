//! Per-finding allow/deny filtering.
//!
//! Three independent axes are evaluated in a fixed order, stopping at the
//! first one that rejects the finding:
//!
//! 1. [`FilterAxis::Account`]: the finding's account id.
//! 2. [`FilterAxis::AccountHierarchy`]: the account's parent groups, resolved
//!    through [`HierarchyResolver`].
//! 3. [`FilterAxis::Tag`]: the union of resource tag keys.
//!
//! Each axis has a match list and a [`FilterMode`]. A disabled axis or an
//! empty match list always passes.
//!
//! # Failure policy
//!
//! Filtering fails open. A configuration store error, an unparseable mode or
//! a hierarchy lookup failure never drops a finding; only an explicit rule
//! match does.

mod hierarchy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

pub use hierarchy::{AccountDirectory, DirectoryError, HierarchyResolver, InMemoryAccountDirectory};

use crate::config_cache::{ConfigCache, ParameterStoreError};
use crate::finding::CanonicalFinding;

/// Value of `applied_filter` when every axis passed.
pub const NO_FILTER_APPLIED: &str = "none";

// =============================================================================
// Axes and modes
// =============================================================================

/// A filter dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterAxis {
    /// Account id.
    Account,
    /// Account hierarchy membership.
    AccountHierarchy,
    /// Resource tag keys.
    Tag,
}

impl FilterAxis {
    /// Evaluation order.
    pub const ORDER: [Self; 3] = [Self::Account, Self::AccountHierarchy, Self::Tag];

    /// Stable name reported as `applied_filter`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account_id_filter",
            Self::AccountHierarchy => "account_hierarchy_filter",
            Self::Tag => "tag_filter",
        }
    }
}

impl fmt::Display for FilterAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an axis treats its match list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Pass iff any value matches.
    Include,
    /// Pass iff no value matches.
    Exclude,
    /// Always pass.
    #[default]
    Disabled,
}

impl FilterMode {
    /// Parses a mode string, case-insensitively. Blank means disabled.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "include" => Some(Self::Include),
            "exclude" => Some(Self::Exclude),
            "disabled" | "" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// One axis of the filter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AxisFilter {
    /// Values to match against.
    pub values: Vec<String>,
    /// Match mode.
    pub mode: FilterMode,
}

impl AxisFilter {
    /// Creates an axis filter.
    #[must_use]
    pub fn new(mode: FilterMode, values: Vec<String>) -> Self {
        Self { values, mode }
    }

    /// Evaluates this axis against the finding's values for it.
    #[must_use]
    pub fn passes(&self, finding_values: &[String]) -> bool {
        if self.mode == FilterMode::Disabled || self.values.is_empty() {
            return true;
        }
        let matched = finding_values.iter().any(|v| self.values.contains(v));
        match self.mode {
            FilterMode::Include => matched,
            FilterMode::Exclude => !matched,
            FilterMode::Disabled => true,
        }
    }
}

/// Splits a comma-separated list, trimming entries and dropping blanks.
#[must_use]
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Configuration
// =============================================================================

/// Filter evaluation errors. All of them make [`FilterEngine::apply_all`]
/// pass the finding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FilterError {
    /// Filter settings could not be read.
    #[error("filter configuration unavailable: {0}")]
    ConfigUnavailable(#[from] ParameterStoreError),

    /// A mode setting holds an unknown value.
    #[error("invalid filter mode {value:?} in {key}")]
    InvalidMode {
        /// Configuration key.
        key: String,
        /// The value found.
        value: String,
    },
}

/// Configuration-store keys holding the filter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterKeys {
    /// Common prefix; one prefix listing loads every setting.
    pub prefix: String,
    /// Comma-separated account ids.
    pub account_values: String,
    /// Account axis mode.
    pub account_mode: String,
    /// Comma-separated parent group ids.
    pub hierarchy_values: String,
    /// Hierarchy axis mode.
    pub hierarchy_mode: String,
    /// Comma-separated tag keys.
    pub tag_values: String,
    /// Tag axis mode.
    pub tag_mode: String,
}

impl FilterKeys {
    /// Keys under `prefix` using the default leaf names.
    #[must_use]
    pub fn under(prefix: &str) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self {
            account_values: format!("{prefix}AccountFilters"),
            account_mode: format!("{prefix}AccountFilterMode"),
            hierarchy_values: format!("{prefix}OrganizationalUnitFilters"),
            hierarchy_mode: format!("{prefix}OrganizationalUnitFilterMode"),
            tag_values: format!("{prefix}TagFilters"),
            tag_mode: format!("{prefix}TagFilterMode"),
            prefix,
        }
    }
}

impl Default for FilterKeys {
    fn default() -> Self {
        Self::under("/Solutions/Posture/Filters/")
    }
}

/// Filter settings for all three axes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterConfig {
    /// Account axis.
    pub account: AxisFilter,
    /// Account hierarchy axis.
    pub hierarchy: AxisFilter,
    /// Tag axis.
    pub tag: AxisFilter,
}

impl FilterConfig {
    /// Builds the configuration from the (cached) configuration store.
    ///
    /// Missing keys mean an empty list or a disabled axis.
    ///
    /// # Errors
    ///
    /// Returns an error when the store listing fails or a mode is unknown.
    pub async fn load(cache: &ConfigCache, keys: &FilterKeys) -> Result<Self, FilterError> {
        let params: HashMap<String, String> = cache
            .get_by_prefix(&keys.prefix)
            .await?
            .into_iter()
            .map(|p| (p.name, p.value))
            .collect();

        let axis = |values_key: &str, mode_key: &str| -> Result<AxisFilter, FilterError> {
            let raw_mode = params.get(mode_key).map_or("", String::as_str);
            let mode = FilterMode::parse(raw_mode).ok_or_else(|| FilterError::InvalidMode {
                key: mode_key.to_string(),
                value: raw_mode.to_string(),
            })?;
            let values = params
                .get(values_key)
                .map(|raw| parse_list(raw))
                .unwrap_or_default();
            Ok(AxisFilter::new(mode, values))
        };

        Ok(Self {
            account: axis(&keys.account_values, &keys.account_mode)?,
            hierarchy: axis(&keys.hierarchy_values, &keys.hierarchy_mode)?,
            tag: axis(&keys.tag_values, &keys.tag_mode)?,
        })
    }

    /// Returns the settings for `axis`.
    #[must_use]
    pub const fn axis(&self, axis: FilterAxis) -> &AxisFilter {
        match axis {
            FilterAxis::Account => &self.account,
            FilterAxis::AccountHierarchy => &self.hierarchy,
            FilterAxis::Tag => &self.tag,
        }
    }
}

// =============================================================================
// FilterEngine
// =============================================================================

/// Outcome of [`FilterEngine::apply_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterResult {
    /// Whether the finding may proceed.
    pub passed: bool,
    /// The axis that rejected the finding, if any.
    pub applied_filter: Option<FilterAxis>,
}

impl FilterResult {
    /// Every axis passed.
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            applied_filter: None,
        }
    }

    /// `axis` rejected the finding.
    #[must_use]
    pub const fn rejected(axis: FilterAxis) -> Self {
        Self {
            passed: false,
            applied_filter: Some(axis),
        }
    }

    /// Name of the rejecting axis, or [`NO_FILTER_APPLIED`].
    #[must_use]
    pub fn applied_filter_name(&self) -> &'static str {
        self.applied_filter.map_or(NO_FILTER_APPLIED, FilterAxis::as_str)
    }
}

/// Evaluates the configured filters against findings.
pub struct FilterEngine {
    config: Arc<ConfigCache>,
    hierarchy: HierarchyResolver,
    keys: FilterKeys,
}

impl FilterEngine {
    /// Creates an engine reading settings under `keys` from `config`.
    #[must_use]
    pub fn new(
        config: Arc<ConfigCache>,
        directory: Arc<dyn AccountDirectory>,
        keys: FilterKeys,
    ) -> Self {
        Self {
            config,
            hierarchy: HierarchyResolver::new(directory),
            keys,
        }
    }

    /// Loads the current filter configuration.
    ///
    /// # Errors
    ///
    /// See [`FilterConfig::load`].
    pub async fn load_config(&self) -> Result<FilterConfig, FilterError> {
        FilterConfig::load(&self.config, &self.keys).await
    }

    /// Evaluates a single axis.
    ///
    /// An account with no parent groups (outside the hierarchy, or whose
    /// lookup failed) passes the hierarchy axis.
    pub async fn passes(
        &self,
        finding: &CanonicalFinding,
        axis: FilterAxis,
        config: &FilterConfig,
    ) -> bool {
        let filter = config.axis(axis);
        if filter.mode == FilterMode::Disabled || filter.values.is_empty() {
            return true;
        }
        let values = match axis {
            FilterAxis::Account => vec![finding.account_id().to_string()],
            FilterAxis::AccountHierarchy => {
                let parents = self.hierarchy.parents_or_empty(finding.account_id()).await;
                if parents.is_empty() {
                    return true;
                }
                parents
            },
            FilterAxis::Tag => finding.tag_keys(),
        };
        filter.passes(&values)
    }

    /// Evaluates every axis in order, stopping at the first rejection.
    ///
    /// Never fails: evaluation errors are logged and the finding passes.
    pub async fn apply_all(&self, finding: &CanonicalFinding) -> FilterResult {
        match self.try_apply_all(finding).await {
            Ok(result) => {
                debug!(
                    finding_id = %finding.id,
                    passed = result.passed,
                    applied_filter = result.applied_filter_name(),
                    "filters evaluated"
                );
                result
            },
            Err(e) => {
                warn!(
                    finding_id = %finding.id,
                    error = %e,
                    "filter evaluation failed, allowing finding"
                );
                FilterResult::pass()
            },
        }
    }

    async fn try_apply_all(&self, finding: &CanonicalFinding) -> Result<FilterResult, FilterError> {
        let config = self.load_config().await?;
        for axis in FilterAxis::ORDER {
            if !self.passes(finding, axis, &config).await {
                return Ok(FilterResult::rejected(axis));
            }
        }
        Ok(FilterResult::pass())
    }

    /// Drops cached filter settings and hierarchy lookups.
    pub async fn invalidate_all(&self) {
        self.config.invalidate_all().await;
        self.hierarchy.invalidate_all().await;
    }
}

impl fmt::Debug for FilterEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEngine")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
