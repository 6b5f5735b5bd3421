//! Orchestrator configuration.
//!
//! This module provides configuration for the pipeline orchestrator:
//! the ordered stage definitions, supervision timeouts, event buffering
//! capacities, run history retention, quota limits, and the optional cron
//! schedule. Configuration is loaded from a JSON file and individual knobs
//! can be overridden through environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Definition of one pipeline stage: an external executable with a fixed
/// argument and environment contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name (e.g. "collect-urls", "generate-images").
    pub name: String,
    /// Executable to launch.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables set for the stage process.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl StageSpec {
    /// Creates a stage spec with no arguments or environment.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Adds arguments to the stage invocation.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable to the stage invocation.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    // Pipeline definition
    /// Name of the pipeline this orchestrator instance drives.
    pub pipeline_name: String,
    /// Ordered stage sequence.
    pub stages: Vec<StageSpec>,
    /// Optional cron expression registered by `conveyor serve`.
    pub schedule: Option<String>,

    // Supervision settings
    /// Seconds to wait after SIGTERM before force-killing a stage.
    pub grace_period_secs: u64,
    /// Seconds of stage silence before it is treated as stalled.
    pub idle_timeout_secs: u64,

    // Registry and broadcast settings
    /// Maximum number of runs retained in the registry (oldest evicted).
    pub run_history_limit: usize,
    /// Per-run ring buffer capacity for observer replay.
    pub ring_capacity: usize,
    /// Bounded queue size per connected observer.
    pub observer_queue_capacity: usize,

    // Quota settings
    /// Path of the persisted quota record shared with stage processes.
    pub quota_path: PathBuf,
    /// Daily call budget for the rate-limited dependency.
    pub quota_daily_limit: u32,
    /// Call counts at which a one-time-per-day warning is emitted.
    pub quota_warn_thresholds: Vec<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "catalog".to_string(),
            stages: Vec::new(),
            schedule: None,

            grace_period_secs: 10,
            idle_timeout_secs: 300, // 5 minutes of silence counts as a stall

            run_history_limit: 50,
            ring_capacity: 500,
            observer_queue_capacity: 256,

            quota_path: PathBuf::from("./conveyor-quota.json"),
            quota_daily_limit: 1500,
            quota_warn_thresholds: vec![1000, 1500],
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a JSON file, then applies environment
    /// variable overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::ParseError {
                path: path.display().to_string(),
                source,
            })?;
        config.with_env_overrides()
    }

    /// Creates configuration from environment variables on top of defaults.
    ///
    /// # Environment Variables
    ///
    /// - `CONVEYOR_GRACE_PERIOD_SECS`: SIGTERM escalation grace (default: 10)
    /// - `CONVEYOR_IDLE_TIMEOUT_SECS`: stage stall timeout (default: 300)
    /// - `CONVEYOR_RUN_HISTORY_LIMIT`: retained runs (default: 50)
    /// - `CONVEYOR_RING_CAPACITY`: replay ring size (default: 500)
    /// - `CONVEYOR_OBSERVER_QUEUE_CAPACITY`: per-observer queue (default: 256)
    /// - `CONVEYOR_QUOTA_PATH`: quota record path
    /// - `CONVEYOR_QUOTA_DAILY_LIMIT`: daily call budget (default: 1500)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides to this configuration.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("CONVEYOR_GRACE_PERIOD_SECS") {
            self.grace_period_secs = parse_env_value(&val, "CONVEYOR_GRACE_PERIOD_SECS")?;
        }
        if let Ok(val) = std::env::var("CONVEYOR_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = parse_env_value(&val, "CONVEYOR_IDLE_TIMEOUT_SECS")?;
        }
        if let Ok(val) = std::env::var("CONVEYOR_RUN_HISTORY_LIMIT") {
            self.run_history_limit = parse_env_value(&val, "CONVEYOR_RUN_HISTORY_LIMIT")?;
        }
        if let Ok(val) = std::env::var("CONVEYOR_RING_CAPACITY") {
            self.ring_capacity = parse_env_value(&val, "CONVEYOR_RING_CAPACITY")?;
        }
        if let Ok(val) = std::env::var("CONVEYOR_OBSERVER_QUEUE_CAPACITY") {
            self.observer_queue_capacity =
                parse_env_value(&val, "CONVEYOR_OBSERVER_QUEUE_CAPACITY")?;
        }
        if let Ok(val) = std::env::var("CONVEYOR_QUOTA_PATH") {
            self.quota_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CONVEYOR_QUOTA_DAILY_LIMIT") {
            self.quota_daily_limit = parse_env_value(&val, "CONVEYOR_QUOTA_DAILY_LIMIT")?;
        }
        Ok(self)
    }

    /// Grace period between SIGTERM and SIGKILL during cancellation.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Maximum stage silence before the stall detector fires.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any setting is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "pipeline_name must not be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one stage must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "stage names must not be empty".to_string(),
                ));
            }
            if stage.command.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}' has no command",
                    stage.name
                )));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        if self.run_history_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "run_history_limit must be at least 1".to_string(),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "ring_capacity must be at least 1".to_string(),
            ));
        }
        if self.observer_queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "observer_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.quota_daily_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "quota_daily_limit must be at least 1".to_string(),
            ));
        }
        for &threshold in &self.quota_warn_thresholds {
            if threshold == 0 || threshold > self.quota_daily_limit {
                return Err(ConfigError::ValidationFailed(format!(
                    "warn threshold {} is outside 1..={}",
                    threshold, self.quota_daily_limit
                )));
            }
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_stages() -> OrchestratorConfig {
        OrchestratorConfig {
            stages: vec![
                StageSpec::new("collect-urls", "/usr/bin/collect"),
                StageSpec::new("upload", "/usr/bin/upload"),
            ],
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.quota_daily_limit, 1500);
        assert_eq!(config.quota_warn_thresholds, vec![1000, 1500]);
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_requires_stages() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_err());
        assert!(config_with_stages().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_stage_names() {
        let mut config = config_with_stages();
        config.stages.push(StageSpec::new("upload", "/bin/true"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = config_with_stages();
        config.quota_warn_thresholds = vec![2000];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = config_with_stages();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.stages[0].name, "collect-urls");
    }

    #[test]
    fn test_from_file_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = OrchestratorConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_stage_spec_builders() {
        let stage = StageSpec::new("generate-images", "python3")
            .with_args(["-m", "generator"])
            .with_env("BATCH_SIZE", "8");
        assert_eq!(stage.args, vec!["-m", "generator"]);
        assert_eq!(stage.env, vec![("BATCH_SIZE".to_string(), "8".to_string())]);
    }
}
