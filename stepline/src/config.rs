//! Engine configuration.
//!
//! Every field has a default; [`EngineConfig::from_env`] overlays
//! `STEPLINE_*` environment variables on top of them.

use crate::core::ExecutionMode;
use crate::engine::{HaltPolicy, ParallelFailurePolicy, DEFAULT_HALT_POLICY};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive such as `info` or `stepline=debug`. Falls back to
    /// `STEPLINE_LOG`, then `info`.
    pub level: Option<String>,
    /// Output format.
    pub format: LogFormat,
}

/// Settings for [`crate::executor::CommandTaskRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRunnerConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments placed before the task reference.
    pub base_args: Vec<String>,
    /// Working directory for the child process.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Default for CommandRunnerConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl CommandRunnerConfig {
    /// Runs `program` with `base_args` before each task reference.
    #[must_use]
    pub fn new(program: impl Into<String>, base_args: &[&str]) -> Self {
        Self {
            program: program.into(),
            base_args: base_args.iter().map(|a| (*a).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

fn default_database_url() -> String {
    "sqlite://stepline.sqlite?mode=rwc".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_store_connections() -> u32 {
    4
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run store location.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Worker pool size when neither the run nor the pipeline sets one.
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
    /// What happens to unrelated pending steps when a run halts.
    #[serde(default = "default_halt_policy")]
    pub halt_policy: HaltPolicy,
    /// What happens to in-flight siblings when a parallel step fails.
    #[serde(default)]
    pub parallel_failure_policy: ParallelFailurePolicy,
    /// Connection pool size of the run store.
    #[serde(default = "default_store_connections")]
    pub store_max_connections: u32,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Process runner settings.
    #[serde(default)]
    pub runner: CommandRunnerConfig,
}

fn default_halt_policy() -> HaltPolicy {
    DEFAULT_HALT_POLICY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            default_max_workers: default_max_workers(),
            halt_policy: DEFAULT_HALT_POLICY,
            parallel_failure_policy: ParallelFailurePolicy::default(),
            store_max_connections: default_store_connections(),
            logging: LoggingConfig::default(),
            runner: CommandRunnerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `STEPLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STEPLINE_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(raw) = lookup("STEPLINE_MAX_WORKERS") {
            self.default_max_workers =
                raw.trim().parse().map_err(|_| ConfigError::InvalidSetting {
                    key: "STEPLINE_MAX_WORKERS".to_string(),
                    reason: format!("'{raw}' is not a positive integer"),
                })?;
        }
        if let Some(raw) = lookup("STEPLINE_HALT_POLICY") {
            self.halt_policy = parse_setting("STEPLINE_HALT_POLICY", &raw)?;
        }
        if let Some(raw) = lookup("STEPLINE_PARALLEL_FAILURE_POLICY") {
            self.parallel_failure_policy =
                parse_setting("STEPLINE_PARALLEL_FAILURE_POLICY", &raw)?;
        }
        if let Some(level) = lookup("STEPLINE_LOG") {
            self.logging.level = Some(level);
        }
        if let Some(raw) = lookup("STEPLINE_LOG_FORMAT") {
            self.logging.format = parse_setting("STEPLINE_LOG_FORMAT", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects out-of-range settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_workers == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "default_max_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "database_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Uses an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }

    /// Sets the database URL.
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the default worker pool size.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.default_max_workers = workers;
        self
    }

    /// Sets the halt policy.
    #[must_use]
    pub fn with_halt_policy(mut self, policy: HaltPolicy) -> Self {
        self.halt_policy = policy;
        self
    }

    /// Sets the parallel failure policy.
    #[must_use]
    pub fn with_parallel_failure_policy(mut self, policy: ParallelFailurePolicy) -> Self {
        self.parallel_failure_policy = policy;
        self
    }

    /// Sets the process runner configuration.
    #[must_use]
    pub fn with_runner(mut self, runner: CommandRunnerConfig) -> Self {
        self.runner = runner;
        self
    }
}

fn parse_setting<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase())).map_err(
        |_| ConfigError::InvalidSetting {
            key: key.to_string(),
            reason: format!("unrecognised value '{raw}'"),
        },
    )
}

/// Per-run overrides passed to `run_pipeline`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Execution mode; falls back to the pipeline default, then sequential.
    pub mode: Option<ExecutionMode>,
    /// Worker pool size; falls back to the pipeline default, then the
    /// engine default.
    pub max_workers: Option<usize>,
    /// Plan the run and log what would execute without running anything.
    pub dry_run: bool,
}

impl RunOptions {
    /// Creates options with no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces an execution mode.
    #[must_use]
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Shortcut for parallel mode with `workers` workers.
    #[must_use]
    pub fn parallel(self, workers: usize) -> Self {
        self.mode(ExecutionMode::Parallel).max_workers(workers)
    }

    /// Forces a worker pool size.
    #[must_use]
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// Requests a dry run.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_workers, 4);
        assert_eq!(config.halt_policy, HaltPolicy::LeavePending);
        assert_eq!(config.parallel_failure_policy, ParallelFailurePolicy::Drain);
        assert_eq!(config.runner.program, "sh");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay_reads_environment() {
        let config = EngineConfig::default()
            .overlay(env(&[
                ("STEPLINE_DATABASE_URL", "sqlite::memory:"),
                ("STEPLINE_MAX_WORKERS", "8"),
                ("STEPLINE_HALT_POLICY", "skip_remaining"),
                ("STEPLINE_PARALLEL_FAILURE_POLICY", "Cancel_Siblings"),
                ("STEPLINE_LOG", "debug"),
                ("STEPLINE_LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.default_max_workers, 8);
        assert_eq!(config.halt_policy, HaltPolicy::SkipRemaining);
        assert_eq!(
            config.parallel_failure_policy,
            ParallelFailurePolicy::CancelSiblings
        );
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = EngineConfig::default()
            .overlay(env(&[("STEPLINE_MAX_WORKERS", "0")]))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG-SETTING");
    }

    #[test]
    fn test_bad_policy_rejected() {
        let err = EngineConfig::default()
            .overlay(env(&[("STEPLINE_HALT_POLICY", "explode")]))
            .unwrap_err();
        assert!(err.to_string().contains("STEPLINE_HALT_POLICY"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"default_max_workers": 2, "runner": {"program": "makim", "base_args": ["--file", "x.yaml"]}}"#,
        )
        .unwrap();
        assert_eq!(config.default_max_workers, 2);
        assert_eq!(config.runner.base_args, vec!["--file", "x.yaml"]);
        assert_eq!(config.halt_policy, DEFAULT_HALT_POLICY);
        assert_eq!(config.store_max_connections, 4);
    }

    #[test]
    fn test_run_options_builder() {
        let options = RunOptions::new().parallel(3).dry_run();
        assert_eq!(options.mode, Some(ExecutionMode::Parallel));
        assert_eq!(options.max_workers, Some(3));
        assert!(options.dry_run);
    }
}
