//! Daemon configuration.
//!
//! The daemon reads a single TOML file. Every section is optional; missing
//! sections take the defaults below.
//!
//! ```toml
//! [store]
//! db_path = "/var/lib/posture/state.db"
//! retention_days = 90
//!
//! [sweep]
//! interval_secs = 3600
//! chunk_size = 20
//! page_size = 100
//! batch_size = 10
//! page_delay_ms = 120
//!
//! [source]
//! export_path = "/var/lib/posture/findings.ndjson"
//!
//! [orchestrator]
//! command = "/usr/local/bin/start-remediation"
//! args = ["--async"]
//!
//! [metrics]
//! enabled = true
//! port = 9100
//!
//! [filters]
//! prefix = "/Solutions/Posture/Filters/"
//!
//! [parameters]
//! "/Solutions/Posture/Filters/AccountFilters" = "111111111111"
//! "/Solutions/Posture/Filters/AccountFilterMode" = "Include"
//!
//! [accounts]
//! "111111111111" = ["ou-root-prod"]
//!
//! [[controls]]
//! control_id = "S3.1"
//! supported = true
//! auto_remediation_enabled = true
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use posture_core::filter::FilterKeys;
use posture_core::remediation_config::RemediationConfigEntry;
use posture_core::state_store::DEFAULT_RETENTION_DAYS;
use posture_core::sweep::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_PAGE_DELAY, DEFAULT_PAGE_SIZE,
    DEFAULT_STANDARD_PREFIXES, SweepConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default metrics HTTP port.
pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// Default interval between scheduled sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    /// State database.
    #[serde(default)]
    pub store: StoreConfig,

    /// Reconciliation sweep tuning and schedule.
    #[serde(default)]
    pub sweep: SweepSettings,

    /// Where the sweep reads findings from.
    #[serde(default)]
    pub source: SourceConfig,

    /// External command that starts remediations.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Prometheus endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Filter key layout.
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Configuration-store parameters, keyed by full hierarchical name.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Account hierarchy: account id to parent group ids.
    #[serde(default)]
    pub accounts: BTreeMap<String, Vec<String>>,

    /// Per-control remediation settings.
    #[serde(default)]
    pub controls: Vec<RemediationConfigEntry>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("sweep.chunk_size", self.sweep.chunk_size),
            ("sweep.page_size", self.sweep.page_size),
            ("sweep.batch_size", self.sweep.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be at least 1")));
            }
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.store.retention_days == 0 {
            return Err(ConfigError::Validation(
                "store.retention_days must be at least 1".to_string(),
            ));
        }
        if self
            .orchestrator
            .command
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "orchestrator.command must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for control in &self.controls {
            if control.control_id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "controls entry with empty control_id".to_string(),
                ));
            }
            if !seen.insert(control.control_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate controls entry for {}",
                    control.control_id
                )));
            }
        }
        Ok(())
    }

    /// Filter keys derived from `[filters]`.
    #[must_use]
    pub fn filter_keys(&self) -> FilterKeys {
        FilterKeys::under(&self.filters.prefix)
    }
}

/// State database settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path to the `SQLite` database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Days a record lives after its last write.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl StoreConfig {
    /// Retention as a duration.
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("posture.db")
}

fn default_retention_days() -> u32 {
    u32::try_from(DEFAULT_RETENTION_DAYS).unwrap_or(90)
}

/// Sweep schedule and tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepSettings {
    /// Seconds between scheduled sweeps in `run` mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Control ids per query.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Findings per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Findings reconciled concurrently.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between pages, in milliseconds.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Generator id prefixes to include.
    #[serde(default = "default_standard_prefixes")]
    pub standard_prefixes: Vec<String>,
}

impl SweepSettings {
    /// Sweep tuning for the core sweep.
    #[must_use]
    pub fn to_sweep_config(&self) -> SweepConfig {
        SweepConfig {
            chunk_size: self.chunk_size,
            page_size: self.page_size,
            batch_size: self.batch_size,
            page_delay: Duration::from_millis(self.page_delay_ms),
            standard_prefixes: self.standard_prefixes.clone(),
        }
    }

    /// Interval between scheduled sweeps.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            chunk_size: default_chunk_size(),
            page_size: default_page_size(),
            batch_size: default_batch_size(),
            page_delay_ms: default_page_delay_ms(),
            standard_prefixes: default_standard_prefixes(),
        }
    }
}

const fn default_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_page_delay_ms() -> u64 {
    u64::try_from(DEFAULT_PAGE_DELAY.as_millis()).unwrap_or(120)
}

fn default_standard_prefixes() -> Vec<String> {
    DEFAULT_STANDARD_PREFIXES.iter().map(ToString::to_string).collect()
}

/// Finding export read by the sweep.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SourceConfig {
    /// Newline-delimited JSON file of canonical findings.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
}

/// Remediation command.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Program started once per remediation. The request is written to its
    /// standard input as JSON.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether metrics are collected and served.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the HTTP endpoint, bound on localhost.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_METRICS_PORT,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

/// Where filter settings live in the parameter map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FiltersConfig {
    /// Common prefix of the filter keys.
    #[serde(default = "default_filter_prefix")]
    pub prefix: String,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            prefix: default_filter_prefix(),
        }
    }
}

fn default_filter_prefix() -> String {
    FilterKeys::default().prefix
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
