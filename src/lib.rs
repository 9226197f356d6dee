//! Load-generation and SLO-gate engine for HTTP services.
//!
//! This crate provides tools to:
//! - Ramp a pool of virtual users over configurable traffic stages
//! - Execute a scenario of HTTP request steps with per-step checks
//! - Collect latency/error metrics safely under concurrency
//! - Evaluate threshold rules into a pass/fail verdict for CI gating

pub mod config;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod pool;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod stages;
pub mod thresholds;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{LoadProfile, StageConfig, TeamMember, ThresholdConfig};
pub use error::{EngineError, EngineResult};
pub use exec::{ExecutedResponse, ReqwestExecutor, RequestExecutor, StepRequest, TransportError};
pub use metrics::{MetricsAggregator, Observation, Snapshot};
pub use pool::VuPool;
pub use report::ResultsReport;
pub use runner::{LoadRunner, RunReport};
pub use scenario::{Scenario, SetupResult, VuContext};
pub use stages::{Stage, StagePlan};
pub use thresholds::{Threshold, Verdict};
