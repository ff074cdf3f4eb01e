//! Run and step records.
//!
//! A [`PipelineRun`] exclusively owns its [`StepRecord`]s. The engines mutate
//! records from a single task and mirror every transition into the run
//! store.

use super::{ExecutionMode, RunStatus, StepStatus};
use crate::utils::{now_utc, step_record_id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many trailing bytes of stderr are kept in failure reasons.
pub const STDERR_TAIL_BYTES: usize = 2048;

/// Execution state of one step within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Persisted id, unique across runs.
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// Step name, unique within the pipeline.
    pub name: String,
    /// Target task reference.
    pub task: String,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Number of task invocations so far.
    pub attempt: u32,
    /// When the step started running.
    pub start_time: Option<Timestamp>,
    /// When the step reached a terminal state.
    pub end_time: Option<Timestamp>,
    /// Captured standard output of the last attempt.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error of the last attempt.
    #[serde(default)]
    pub stderr: String,
    /// Exit code of the last attempt.
    pub exit_code: Option<i32>,
    /// Why the step did not complete.
    pub error: Option<String>,
}

impl StepRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn new(run_id: impl Into<String>, name: impl Into<String>, task: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let name = name.into();
        Self {
            id: step_record_id(&run_id, &name),
            run_id,
            name,
            task: task.into(),
            status: StepStatus::Pending,
            attempt: 0,
            start_time: None,
            end_time: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
        }
    }

    /// Moves the record to `next`, stamping start/end times.
    ///
    /// Returns false and leaves the record untouched when the transition
    /// would break the monotonic lifecycle.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                step = %self.name,
                run_id = %self.run_id,
                from = %self.status,
                to = %next,
                "rejected non-monotonic step transition"
            );
            return false;
        }
        let now = now_utc();
        if next == StepStatus::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        true
    }

    /// Marks the record skipped with a reason.
    pub fn skip(&mut self, reason: impl Into<String>) -> bool {
        if self.transition(StepStatus::Skipped) {
            self.error = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// Returns the run time, once the step has both timestamps.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Returns at most the last [`STDERR_TAIL_BYTES`] of `text`, cut on a char
/// boundary.
#[must_use]
pub fn tail(text: &str) -> &str {
    if text.len() <= STDERR_TAIL_BYTES {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// One execution instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique, time-derived run id.
    pub id: String,
    /// The pipeline this run executes.
    pub pipeline_name: String,
    /// Run lifecycle status.
    pub status: RunStatus,
    /// When the run started.
    pub start_time: Timestamp,
    /// When the run finished.
    pub end_time: Option<Timestamp>,
    /// Engine used for this run.
    pub mode: ExecutionMode,
    /// Worker pool size for parallel runs.
    pub max_workers: usize,
    /// Step records keyed by step name.
    pub steps: BTreeMap<String, StepRecord>,
    /// Why the run did not complete.
    pub error: Option<String>,
}

impl PipelineRun {
    /// Creates a running run with no steps.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        pipeline_name: impl Into<String>,
        mode: ExecutionMode,
        max_workers: usize,
    ) -> Self {
        Self {
            id: id.into(),
            pipeline_name: pipeline_name.into(),
            status: RunStatus::Running,
            start_time: now_utc(),
            end_time: None,
            mode,
            max_workers,
            steps: BTreeMap::new(),
            error: None,
        }
    }

    /// Adds a pending step record for `name`.
    pub fn add_step(&mut self, name: impl Into<String>, task: impl Into<String>) {
        let name = name.into();
        let record = StepRecord::new(self.id.clone(), name.clone(), task);
        self.steps.insert(name, record);
    }

    /// Returns a step record.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Returns a mutable step record.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.get_mut(name)
    }

    /// Returns the status of a step, if it exists.
    #[must_use]
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps.get(name).map(|s| s.status)
    }

    /// Total number of steps.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Number of steps that are `completed` or `skipped`.
    #[must_use]
    pub fn completed_steps(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status.is_terminal_success())
            .count()
    }

    /// Fraction of steps completed, in `0.0..=1.0`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.completed_steps() as f64 / self.total_steps() as f64
    }

    /// Names of steps still pending.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Finalizes the run with a terminal status.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.end_time = Some(now_utc());
        if error.is_some() {
            self.error = error;
        }
    }
}

/// The outcome of `run_pipeline` and `retry_failed_pipeline`.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The run as it ended.
    pub run: PipelineRun,
    /// Whether this was a dry run (nothing executed or persisted).
    pub dry_run: bool,
    /// Topological order computed for the run.
    pub planned_order: Vec<String>,
}

impl RunReport {
    /// Returns true if the run completed, or if this was a dry run.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.dry_run || self.run.status == RunStatus::Completed
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    /// The final run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    /// Shortcut to a step record.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.run.step(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_record_lifecycle() {
        let mut step = StepRecord::new("r1", "build", "ci.build");
        assert_eq!(step.id, "r1:build");
        assert!(step.transition(StepStatus::Running));
        assert!(step.start_time.is_some());
        assert!(step.transition(StepStatus::Completed));
        assert!(step.end_time.is_some());
        assert!(step.duration().is_some());

        // terminal is final
        assert!(!step.transition(StepStatus::Running));
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn test_skip_records_reason() {
        let mut step = StepRecord::new("r1", "publish", "ci.publish");
        assert!(step.skip("dependency 'test' failed"));
        assert_eq!(step.status, StepStatus::Skipped);
        assert_eq!(step.error.as_deref(), Some("dependency 'test' failed"));
        assert!(step.start_time.is_none());
    }

    #[test]
    fn test_run_progress() {
        let mut run = PipelineRun::new("r1", "deploy", ExecutionMode::Sequential, 1);
        run.add_step("a", "t.a");
        run.add_step("b", "t.b");
        run.add_step("c", "t.c");
        run.add_step("d", "t.d");
        assert!(run.progress().abs() < f64::EPSILON);

        run.step_mut("a").unwrap().transition(StepStatus::Running);
        run.step_mut("a").unwrap().transition(StepStatus::Completed);
        run.step_mut("b").unwrap().skip("condition false");

        assert_eq!(run.completed_steps(), 2);
        assert!((run.progress() - 0.5).abs() < f64::EPSILON);
        assert_eq!(run.pending_steps(), vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_tail_respects_char_boundary() {
        let long = "é".repeat(STDERR_TAIL_BYTES);
        let t = tail(&long);
        assert!(t.len() <= STDERR_TAIL_BYTES);
        assert!(t.chars().all(|c| c == 'é'));
        assert_eq!(tail("short"), "short");
    }
}
