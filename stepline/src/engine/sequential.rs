//! Sequential engine: one step at a time, in topological order.

use super::context::{failure_reason, RunContext};
use crate::core::{PipelineRun, RunStatus, StepStatus};
use crate::errors::Result;
use tracing::debug;

/// Executes steps strictly one after another.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialEngine;

impl SequentialEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Walks the topological order, stopping at the first failure or when
    /// cancellation is requested. The run is finalized before returning.
    pub async fn execute(&self, ctx: &RunContext, run: &mut PipelineRun) -> Result<()> {
        let scope = ctx.scope(run);

        for name in ctx.graph.topological_order() {
            if ctx.cancel.is_cancelled() {
                let reason = ctx.cancel_reason();
                ctx.halt(&scope, run, &reason).await?;
                return ctx.finalize(run, RunStatus::Cancelled, Some(reason)).await;
            }

            if run.step_status(name) != Some(StepStatus::Pending) {
                continue;
            }
            let Some(spec) = ctx.graph.step(name) else {
                continue;
            };

            if let Some((dependency, status)) = ctx.blocking_dependency(run, name) {
                debug!(run_id = %run.id, step = %name, dependency = %dependency, "Dependency not completed");
                ctx.propagate_skip(&scope, run, name, &dependency, status)
                    .await?;
                continue;
            }

            if ctx.try_carry_over(&scope, run, name).await? {
                continue;
            }

            let Some(record) = run.step(name).cloned() else {
                continue;
            };
            let record = ctx.executor.execute(&scope, spec, record).await?;
            let failed = record.status == StepStatus::Failed;
            let reason = failure_reason(&record);
            run.steps.insert(name.clone(), record);
            ctx.record_progress(run).await?;

            if failed {
                ctx.halt(&scope, run, &reason).await?;
                return ctx.finalize(run, RunStatus::Failed, Some(reason)).await;
            }
        }

        ctx.finalize(run, RunStatus::Completed, None).await
    }
}
