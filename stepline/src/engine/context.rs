//! Run context and halt policies shared by both engines.

use crate::cancellation::CancellationToken;
use crate::core::{PipelineRun, RunStatus, StepRecord, StepStatus};
use crate::errors::Result;
use crate::events::{EventType, LifecycleEvent};
use crate::executor::{StepExecutor, StepScope};
use crate::pipeline::PipelineGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happens to pending steps that do not depend on the failure when a
/// run halts.
///
/// Dependents of a failed step are always skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltPolicy {
    /// Unrelated steps stay `pending`.
    #[default]
    LeavePending,
    /// Unrelated steps become `skipped`.
    SkipRemaining,
}

/// Halt policy used when none is configured.
pub const DEFAULT_HALT_POLICY: HaltPolicy = HaltPolicy::LeavePending;

/// What the parallel engine does with in-flight steps after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailurePolicy {
    /// Stop dispatching and let in-flight steps finish.
    #[default]
    Drain,
    /// Stop dispatching and abort in-flight steps.
    CancelSiblings,
}

/// Everything an engine needs to execute one run.
///
/// Built once per run and passed by reference; nothing in it changes while
/// the run executes except the cancellation flag.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Validated graph of the pipeline.
    pub graph: Arc<PipelineGraph>,
    /// Step executor.
    pub executor: Arc<StepExecutor>,
    /// Cooperative cancellation flag of the run.
    pub cancel: Arc<CancellationToken>,
    /// Fate of unrelated pending steps when the run halts.
    pub halt_policy: HaltPolicy,
    /// Fate of in-flight siblings when a parallel step fails.
    pub failure_policy: ParallelFailurePolicy,
    /// Outcomes of an earlier run, reused instead of re-executing.
    pub carry_over: BTreeMap<String, StepRecord>,
}

impl RunContext {
    /// Creates a context with default policies.
    #[must_use]
    pub fn new(graph: Arc<PipelineGraph>, executor: Arc<StepExecutor>) -> Self {
        Self {
            graph,
            executor,
            cancel: Arc::new(CancellationToken::new()),
            halt_policy: DEFAULT_HALT_POLICY,
            failure_policy: ParallelFailurePolicy::default(),
            carry_over: BTreeMap::new(),
        }
    }

    /// Uses `cancel` as the run's cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
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
    pub fn with_failure_policy(mut self, policy: ParallelFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Reuses `records` (keyed by step name) instead of executing those steps.
    #[must_use]
    pub fn with_carry_over(mut self, records: BTreeMap<String, StepRecord>) -> Self {
        self.carry_over = records;
        self
    }

    /// Step scope for `run`, never aborted.
    #[must_use]
    pub fn scope(&self, run: &PipelineRun) -> StepScope {
        StepScope::new(&run.pipeline_name, &run.id)
    }

    /// First dependency of `step` that has not completed, with its status.
    #[must_use]
    pub fn blocking_dependency(&self, run: &PipelineRun, step: &str) -> Option<(String, StepStatus)> {
        self.graph.dependencies_of(step).iter().find_map(|dep| {
            let status = run.step_status(dep)?;
            (status != StepStatus::Completed).then(|| (dep.clone(), status))
        })
    }

    /// Skips `step` because `dependency` failed or was skipped.
    pub async fn propagate_skip(
        &self,
        scope: &StepScope,
        run: &mut PipelineRun,
        step: &str,
        dependency: &str,
        status: StepStatus,
    ) -> Result<()> {
        let reason = match status {
            StepStatus::Failed => format!("dependency '{dependency}' failed"),
            StepStatus::Skipped => format!("dependency '{dependency}' was skipped"),
            other => format!("dependency '{dependency}' is {other}"),
        };
        if let Some(record) = run.step_mut(step) {
            self.executor.skip(scope, record, reason).await?;
        }
        self.record_progress(run).await
    }

    /// Marks `step` completed from the carried-over record, if there is one.
    /// Returns true when the step was carried over.
    pub async fn try_carry_over(
        &self,
        scope: &StepScope,
        run: &mut PipelineRun,
        step: &str,
    ) -> Result<bool> {
        let Some(previous) = self.carry_over.get(step) else {
            return Ok(false);
        };
        if let Some(record) = run.step_mut(step) {
            self.executor.carry_over(scope, record, previous).await?;
        }
        self.record_progress(run).await?;
        Ok(true)
    }

    /// Persists the run's completed-step count and progress fraction.
    pub async fn record_progress(&self, run: &PipelineRun) -> Result<()> {
        self.executor
            .store()
            .update_run_progress(run)
            .await
    }

    /// Resolves pending steps once the run stops dispatching.
    ///
    /// Walks the remaining steps in topological order: a step behind a
    /// failed or skipped dependency is skipped, everything else follows
    /// the halt policy.
    pub async fn halt(&self, scope: &StepScope, run: &mut PipelineRun, reason: &str) -> Result<()> {
        for name in self.graph.topological_order() {
            if run.step_status(name) != Some(StepStatus::Pending) {
                continue;
            }
            let blocked = self
                .blocking_dependency(run, name)
                .filter(|(_, status)| matches!(status, StepStatus::Failed | StepStatus::Skipped));
            if let Some((dependency, status)) = blocked {
                self.propagate_skip(scope, run, name, &dependency, status)
                    .await?;
            } else if self.halt_policy == HaltPolicy::SkipRemaining {
                if let Some(record) = run.step_mut(name) {
                    self.executor
                        .skip(scope, record, format!("run halted: {reason}"))
                        .await?;
                }
            }
        }
        self.record_progress(run).await
    }

    /// Writes the terminal run status and emits the matching event.
    pub async fn finalize(
        &self,
        run: &mut PipelineRun,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        run.finish(status, error);
        self.executor.store().finish_run(run).await?;

        let event_type = match status {
            RunStatus::Completed => EventType::RunCompleted,
            RunStatus::Cancelled => EventType::RunCancelled,
            RunStatus::Failed | RunStatus::Running => EventType::RunFailed,
        };
        let event = LifecycleEvent::run(event_type, &run.pipeline_name, &run.id).with_data(
            serde_json::json!({
                "status": status.as_str(),
                "progress": run.progress(),
                "error": run.error,
            }),
        );
        self.executor.events().try_emit(event);

        match status {
            RunStatus::Completed => info!(
                pipeline = %run.pipeline_name,
                run_id = %run.id,
                steps = run.total_steps(),
                "Run completed"
            ),
            RunStatus::Cancelled => warn!(
                pipeline = %run.pipeline_name,
                run_id = %run.id,
                reason = ?run.error,
                "Run cancelled"
            ),
            _ => error!(
                pipeline = %run.pipeline_name,
                run_id = %run.id,
                error = ?run.error,
                "Run failed"
            ),
        }
        Ok(())
    }

    /// Reason recorded for a cancelled run.
    #[must_use]
    pub fn cancel_reason(&self) -> String {
        self.cancel
            .reason()
            .map_or_else(|| "cancelled".to_string(), |r| format!("cancelled: {r}"))
    }
}

/// Reason recorded for a run halted by a failed step.
pub(crate) fn failure_reason(step: &StepRecord) -> String {
    match &step.error {
        Some(error) => format!("step '{}' failed: {error}", step.name),
        None => format!("step '{}' failed", step.name),
    }
}
