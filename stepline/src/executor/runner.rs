//! The task runner boundary.
//!
//! The engine never interprets task references or arguments itself; it
//! hands them to a [`TaskRunner`] together with an [`OutputSink`] that
//! receives output line by line as it is produced.

use crate::core::LogType;
use crate::errors::TaskError;
use crate::pipeline::ArgValue;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One invocation of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: String,
    /// Step name.
    pub step: String,
    /// Qualified task reference.
    pub task: String,
    /// Arguments for the task.
    pub args: BTreeMap<String, ArgValue>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// Output of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl TaskOutput {
    /// Creates an output with only stdout.
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
        }
    }
}

/// Receives output lines while a task runs.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Handles one line, without its trailing newline.
    async fn line(&self, log_type: LogType, line: &str);
}

/// Discards output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutputSink;

#[async_trait]
impl OutputSink for NullOutputSink {
    async fn line(&self, _log_type: LogType, _line: &str) {}
}

/// Executes one task.
///
/// A non-zero exit is reported as [`TaskError::NonZeroExit`]. Dropping the
/// returned future must stop the underlying work: the step executor relies
/// on that for timeouts and sibling cancellation.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs the task, streaming output into `output`.
    async fn run(&self, request: &TaskRequest, output: &dyn OutputSink)
        -> Result<TaskOutput, TaskError>;
}
