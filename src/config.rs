//! Configuration loading and management.

use crate::error::{EngineError, EngineResult};
use crate::stages::{Stage, StagePlan};
use crate::thresholds::Threshold;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main load profile loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    /// Target the first stage ramps from.
    #[serde(default)]
    pub start_target: u32,
    pub stages: Vec<StageConfig>,
    #[serde(default = "default_think_time_ms")]
    pub think_time_ms: u64,
    #[serde(default = "default_create_pr_probability")]
    pub create_pr_probability: f64,
    /// Drain grace period after the final stage ends.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub seed: Option<u64>, // Optional RNG seed for reproducible runs
    #[serde(default)]
    pub log_requests: bool, // Log all requests to file for debugging
    #[serde(default = "default_team_name")]
    pub team_name: String,
    #[serde(default = "default_author_id")]
    pub author_id: String,
    #[serde(default = "default_members")]
    pub members: Vec<TeamMember>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
}

fn default_think_time_ms() -> u64 {
    405
}

fn default_create_pr_probability() -> f64 {
    0.1
}

fn default_grace_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_team_name() -> String {
    "load-test-team".to_string()
}

fn default_author_id() -> String {
    "lt-u1".to_string()
}

fn default_members() -> Vec<TeamMember> {
    (1..=3)
        .map(|i| TeamMember {
            user_id: format!("lt-u{}", i),
            username: format!("LoadTestUser{}", i),
            is_active: true,
        })
        .collect()
}

/// One ramp segment of the traffic profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub duration_secs: u64,
    pub target: u32,
}

/// Member of the team created by the setup phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: String,
    pub username: String,
    pub is_active: bool,
}

/// Threshold rules attached to one metric selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    pub rules: Vec<String>,
}

impl LoadProfile {
    /// Load a profile from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let profile: LoadProfile = serde_yaml::from_str(&content)?;
        Ok(profile)
    }

    /// Validate the profile, parsing every threshold rule up front so a
    /// malformed rule fails the run before any load is generated.
    pub fn validate(&self) -> EngineResult<()> {
        if self.base_url.is_empty() {
            return Err(EngineError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one stage must be specified".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.create_pr_probability) {
            return Err(EngineError::InvalidConfig(format!(
                "create_pr_probability must be within [0,1], got {}",
                self.create_pr_probability
            )));
        }
        self.parse_thresholds()?;
        Ok(())
    }

    /// Parse the configured thresholds into their typed form.
    pub fn parse_thresholds(&self) -> EngineResult<Vec<Threshold>> {
        let mut thresholds = Vec::new();
        for entry in &self.thresholds {
            for rule in &entry.rules {
                thresholds.push(Threshold::parse(&entry.metric, rule)?);
            }
        }
        Ok(thresholds)
    }

    pub fn stage_plan(&self) -> StagePlan {
        let stages = self
            .stages
            .iter()
            .map(|s| Stage::new(Duration::from_secs(s.duration_secs), s.target))
            .collect();
        StagePlan::new(self.start_target, stages)
    }

    pub fn think_time(&self) -> Duration {
        Duration::from_millis(self.think_time_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Peak concurrency across the whole profile, for sizing the client pool.
    pub fn peak_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(self.start_target)
            .max(self.start_target)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
name: smoke
base_url: http://localhost:8080
stages:
  - { duration_secs: 30, target: 1 }
  - { duration_secs: 60, target: 1 }
  - { duration_secs: 30, target: 0 }
thresholds:
  - metric: http_req_duration
    rules: ["p(99)<300"]
  - metric: "http_req_failed{name:!setup_create_team}"
    rules: ["rate<0.001"]
  - metric: errors
    rules: ["rate<0.001"]
  - metric: http_reqs
    rules: ["rate>=4.8", "rate<=5.2"]
"#;

    #[test]
    fn test_defaults_applied() {
        let profile: LoadProfile = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(profile.think_time_ms, 405);
        assert_eq!(profile.create_pr_probability, 0.1);
        assert_eq!(profile.grace_secs, 30);
        assert_eq!(profile.team_name, "load-test-team");
        assert_eq!(profile.author_id, "lt-u1");
        assert_eq!(profile.members.len(), 3);
        assert_eq!(profile.members[0].user_id, "lt-u1");
        assert!(profile.seed.is_none());
        profile.validate().unwrap();
        assert_eq!(profile.parse_thresholds().unwrap().len(), 5);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let profile = LoadProfile::from_file(file.path()).unwrap();
        assert_eq!(profile.name, "smoke");
        assert_eq!(profile.stages.len(), 3);
    }

    #[test]
    fn test_validate_rejects_empty_stages() {
        let mut profile: LoadProfile = serde_yaml::from_str(MINIMAL).unwrap();
        profile.stages.clear();
        assert!(matches!(
            profile.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_probability() {
        let mut profile: LoadProfile = serde_yaml::from_str(MINIMAL).unwrap();
        profile.create_pr_probability = 1.5;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_threshold() {
        let mut profile: LoadProfile = serde_yaml::from_str(MINIMAL).unwrap();
        profile.thresholds.push(ThresholdConfig {
            metric: "errors".to_string(),
            rules: vec!["p99 under 300".to_string()],
        });
        assert!(matches!(
            profile.validate(),
            Err(EngineError::ThresholdParse { .. })
        ));
    }

    #[test]
    fn test_stage_plan_and_peak() {
        let profile: LoadProfile = serde_yaml::from_str(MINIMAL).unwrap();
        let plan = profile.stage_plan();
        assert_eq!(plan.total_duration(), Duration::from_secs(120));
        assert_eq!(profile.peak_target(), 1);
    }
}
