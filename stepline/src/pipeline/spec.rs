//! Pipeline and step definitions.
//!
//! Definitions are plain data, deserializable from JSON, and never change
//! once registered in a [`super::PipelineCatalog`].

use super::RetryPolicy;
use crate::core::ExecutionMode;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A single argument value passed to the task runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// A flag. `true` is passed as a bare switch, `false` is omitted.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    String(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Specification of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique name within the pipeline.
    pub name: String,
    /// Qualified task reference understood by the task runner.
    pub task: String,
    /// Arguments passed to the task.
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
    /// Optional condition; a false result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Explicit dependencies.
    ///
    /// `None` means the step depends on the step declared just before it.
    /// `Some(vec![])` makes it a root step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Timeout per attempt, in seconds.
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl StepSpec {
    /// Creates a step with an implicit dependency on its predecessor.
    #[must_use]
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            args: BTreeMap::new(),
            condition: None,
            depends_on: None,
            retry: RetryPolicy::default(),
            timeout_seconds: None,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Sets the condition expression.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Sets explicit dependencies. An empty slice makes this a root step.
    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = Some(deps.iter().map(|d| (*d).to_string()).collect());
        self
    }

    /// Makes this a root step with no dependencies.
    #[must_use]
    pub fn independent(self) -> Self {
        self.depends_on(&[])
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    /// Returns the per-attempt timeout, ignoring non-positive values and
    /// values too large for a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    /// Checks that the timeout and backoff settings are representable as
    /// durations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] naming the offending field.
    pub fn validate_durations(&self) -> Result<(), ConfigError> {
        let fields = [
            ("timeout_seconds", self.timeout_seconds),
            ("retry.backoff_seconds", Some(self.retry.backoff_seconds)),
            ("retry.max_backoff_seconds", Some(self.retry.max_backoff_seconds)),
        ];
        for (field, value) in fields {
            let Some(seconds) = value else { continue };
            if seconds <= 0.0 {
                continue;
            }
            if Duration::try_from_secs_f64(seconds).is_err() {
                return Err(ConfigError::InvalidSetting {
                    key: format!("steps.{}.{field}", self.name),
                    reason: format!("{seconds} seconds is out of range"),
                });
            }
        }
        Ok(())
    }
}

/// A named pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<StepSpec>,
    /// Default execution mode for runs of this pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    /// Default worker pool size for parallel runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
}

impl PipelineDefinition {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: None,
            steps: Vec::new(),
            mode: None,
            max_workers: None,
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the help text.
    #[must_use]
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Sets the default execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the default worker pool size.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// Parses a definition from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Looks up a step by name.
    #[must_use]
    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_pipeline() {
        let json = r#"{
            "name": "deploy",
            "help": "build and ship",
            "mode": "parallel",
            "max_workers": 2,
            "steps": [
                {"name": "build", "task": "ci.build", "retry": {"attempts": 2, "backoff": 1}},
                {"name": "test", "task": "ci.test", "args": {"verbose": true, "shard": 3}},
                {"name": "publish", "task": "ci.publish", "depends_on": ["test"], "timeout": 30}
            ]
        }"#;

        let def = PipelineDefinition::from_json(json).unwrap();
        assert_eq!(def.name, "deploy");
        assert_eq!(def.mode, Some(ExecutionMode::Parallel));
        assert_eq!(def.max_workers, Some(2));
        assert_eq!(def.steps.len(), 3);

        let build = def.find_step("build").unwrap();
        assert_eq!(build.retry.max_attempts, 2);
        assert!(build.depends_on.is_none());

        let test = def.find_step("test").unwrap();
        assert_eq!(test.args.get("verbose"), Some(&ArgValue::Bool(true)));
        assert_eq!(test.args.get("shard"), Some(&ArgValue::Int(3)));

        let publish = def.find_step("publish").unwrap();
        assert_eq!(publish.depends_on, Some(vec!["test".to_string()]));
        assert_eq!(publish.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_explicit_empty_depends_on_is_kept() {
        let step: StepSpec =
            serde_json::from_str(r#"{"name": "b", "task": "t.b", "depends_on": []}"#).unwrap();
        assert_eq!(step.depends_on, Some(Vec::new()));
    }

    #[test]
    fn test_builder() {
        let step = StepSpec::new("lint", "ci.lint")
            .with_arg("fix", true)
            .with_arg("path", "src")
            .with_condition("true")
            .independent()
            .with_timeout(Duration::from_millis(1500));

        assert_eq!(step.args.len(), 2);
        assert_eq!(step.condition.as_deref(), Some("true"));
        assert_eq!(step.depends_on, Some(Vec::new()));
        assert_eq!(step.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_non_positive_timeout_is_ignored() {
        let mut step = StepSpec::new("a", "t.a");
        step.timeout_seconds = Some(0.0);
        assert_eq!(step.timeout(), None);
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let step: StepSpec =
            serde_json::from_str(r#"{"name": "wait", "task": "t.wait", "timeout": 1e20}"#).unwrap();
        assert_eq!(step.timeout(), None);
        let err = step.validate_durations().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidSetting {
                key: "steps.wait.timeout_seconds".into(),
                reason: "100000000000000000000 seconds is out of range".into(),
            }
        );

        let mut backoff = StepSpec::new("b", "t.b");
        backoff.retry.max_backoff_seconds = f64::INFINITY;
        assert_eq!(
            backoff.validate_durations().unwrap_err().code(),
            "CONFIG-SETTING"
        );

        let fine = StepSpec::new("c", "t.c").with_timeout(Duration::from_secs(3600));
        assert!(fine.validate_durations().is_ok());
    }

    #[test]
    fn test_arg_display() {
        assert_eq!(ArgValue::from("x").to_string(), "x");
        assert_eq!(ArgValue::Int(-4).to_string(), "-4");
        assert_eq!(ArgValue::Float(1.5).to_string(), "1.5");
        assert_eq!(ArgValue::Bool(true).to_string(), "true");
    }
}
