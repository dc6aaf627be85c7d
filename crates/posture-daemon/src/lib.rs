//! # posture-daemon
//!
//! Hosts the posture pipeline as a long-running service:
//!
//! - [`store`]: `SQLite` finding state and remediation history
//! - [`backends`]: NDJSON finding export and a process-spawning orchestrator
//! - [`metrics`]: Prometheus export of pipeline metrics
//! - [`config`]: TOML configuration
//! - [`services`]: assembly of the core pipeline from configuration
//! - [`server`]: HTTP event delivery and `/metrics`

pub mod backends;
pub mod config;
pub mod metrics;
pub mod server;
pub mod services;
pub mod store;

pub use config::DaemonConfig;
pub use services::{IngestSummary, Services};
