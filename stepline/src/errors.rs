//! Error types for the stepline engine.
//!
//! Configuration errors are detected before anything executes and are never
//! retried. Step execution errors never surface here: the step executor folds
//! them into a `failed` step record. What remains are store failures, lookup
//! misses and the deadlock invariant violation.

use thiserror::Error;

/// The main error type for stepline operations.
#[derive(Debug, Error)]
pub enum SteplineError {
    /// A configuration problem detected before execution.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run store failed.
    #[error("Run store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The parallel engine found pending steps with nothing ready and nothing
    /// in flight.
    #[error("Deadlock in run '{run_id}': no step is ready, pending steps: {}", pending.join(", "))]
    Deadlock {
        /// The run that deadlocked.
        run_id: String,
        /// Steps still pending when the deadlock was detected.
        pending: Vec<String>,
    },

    /// No run with the given id exists.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// `retry_failed_pipeline` found nothing to retry.
    #[error("No failed run found for pipeline '{0}'")]
    NoFailedRun(String),

    /// No active schedule matched the given id or pipeline name.
    #[error("No active schedule found for '{0}'")]
    ScheduleNotFound(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SteplineError {
    /// Returns true for fail-fast configuration errors.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true for the deadlock invariant violation.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SteplineError>;

/// Configuration errors. All of these are raised before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The pipeline name is not in the catalog.
    #[error("Unknown pipeline: '{name}'")]
    UnknownPipeline {
        /// The requested pipeline name.
        name: String,
    },

    /// The pipeline declares no steps.
    #[error("Pipeline '{pipeline}' has no steps")]
    EmptyPipeline {
        /// The pipeline name.
        pipeline: String,
    },

    /// A pipeline or step name contains characters the engine cannot use as
    /// a key.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two steps share a name.
    #[error("Pipeline '{pipeline}' declares step '{step}' more than once")]
    DuplicateStep {
        /// The pipeline name.
        pipeline: String,
        /// The duplicated step name.
        step: String,
    },

    /// A `depends_on` entry names a step that does not exist.
    #[error("Pipeline '{pipeline}': step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency {
        /// The pipeline name.
        pipeline: String,
        /// The step declaring the dependency.
        step: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Pipeline '{pipeline}' contains cyclic dependencies: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The pipeline name.
        pipeline: String,
        /// The steps forming the cycle, first step repeated at the end.
        cycle: Vec<String>,
    },

    /// A cron or interval expression could not be parsed.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        /// The rejected expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An engine setting is out of range.
    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting {
        /// The setting key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Returns a stable machine-readable code for the error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownPipeline { .. } => "CONFIG-UNKNOWN-PIPELINE",
            Self::EmptyPipeline { .. } => "CONFIG-EMPTY",
            Self::InvalidName { .. } => "CONFIG-INVALID-NAME",
            Self::DuplicateStep { .. } => "CONFIG-DUPLICATE-STEP",
            Self::MissingDependency { .. } => "CONFIG-MISSING-DEP",
            Self::CycleDetected { .. } => "CONFIG-CYCLE",
            Self::InvalidSchedule { .. } => "CONFIG-SCHEDULE",
            Self::InvalidSetting { .. } => "CONFIG-SETTING",
        }
    }

    /// Returns a hint for fixing the error.
    #[must_use]
    pub fn fix_hint(&self) -> &'static str {
        match self {
            Self::UnknownPipeline { .. } => {
                "Check the pipeline name against the loaded pipeline definitions."
            }
            Self::EmptyPipeline { .. } => "Add at least one step to the pipeline.",
            Self::InvalidName { .. } => {
                "Use letters, digits, '_', '-', '.' or '/' and start with a letter or digit."
            }
            Self::DuplicateStep { .. } => "Give every step in the pipeline a distinct name.",
            Self::MissingDependency { .. } => {
                "Ensure all dependencies reference steps that exist in the pipeline. \
                 Check for typos in step names."
            }
            Self::CycleDetected { .. } => {
                "Remove one of the dependencies in the cycle to break it. \
                 Use a linear chain or fan-out pattern instead."
            }
            Self::InvalidSchedule { .. } => {
                "Use a five- or six-field cron expression, or a positive interval in seconds."
            }
            Self::InvalidSetting { .. } => "Correct the engine configuration value.",
        }
    }
}

/// Errors reported by a [`crate::executor::TaskRunner`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task ran and exited with a non-zero status.
    #[error("Task exited with code {code}")]
    NonZeroExit {
        /// The exit code.
        code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The task process could not be started.
    #[error("Failed to start task '{task}': {reason}")]
    Spawn {
        /// The task that failed to start.
        task: String,
        /// The underlying reason.
        reason: String,
    },

    /// IO failure while talking to the task.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Returns the exit code this error maps to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NonZeroExit { code, .. } => *code,
            _ => 1,
        }
    }

    /// Returns the captured standard error, or the error message when the
    /// task never produced any.
    #[must_use]
    pub fn stderr(&self) -> String {
        match self {
            Self::NonZeroExit { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = ConfigError::CycleDetected {
            pipeline: "deploy".to_string(),
            cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };

        let msg = err.to_string();
        assert!(msg.contains("deploy"));
        assert!(msg.contains("a -> b -> c -> a"));
        assert_eq!(err.code(), "CONFIG-CYCLE");
    }

    #[test]
    fn test_config_error_is_configuration() {
        let err: SteplineError = ConfigError::UnknownPipeline {
            name: "nope".to_string(),
        }
        .into();

        assert!(err.is_configuration());
        assert!(!err.is_deadlock());
    }

    #[test]
    fn test_deadlock_is_distinguishable() {
        let err = SteplineError::Deadlock {
            run_id: "r1".to_string(),
            pending: vec!["x".to_string(), "y".to_string()],
        };

        assert!(err.is_deadlock());
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("x, y"));
    }

    #[test]
    fn test_task_error_exit_code() {
        let err = TaskError::NonZeroExit {
            code: 3,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.stderr(), "boom");

        let spawn = TaskError::Spawn {
            task: "build".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(spawn.exit_code(), 1);
        assert!(spawn.stderr().contains("not found"));
    }

    #[test]
    fn test_every_config_error_has_hint() {
        let errors = [
            ConfigError::EmptyPipeline { pipeline: "p".into() },
            ConfigError::MissingDependency {
                pipeline: "p".into(),
                step: "b".into(),
                dependency: "zz".into(),
            },
            ConfigError::InvalidSchedule {
                expression: "* *".into(),
                reason: "too few fields".into(),
            },
        ];

        for err in errors {
            assert!(!err.fix_hint().is_empty());
            assert!(err.code().starts_with("CONFIG-"));
        }
    }
}
