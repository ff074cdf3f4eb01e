//! Execution engines.
//!
//! Both engines consume a [`RunContext`] and a freshly persisted
//! [`PipelineRun`], drive its steps through the step executor and finalize
//! the run before returning:
//!
//! - [`SequentialEngine`] walks one topological order.
//! - [`ParallelEngine`] dispatches ready steps to a bounded worker pool.

mod context;
mod parallel;
mod sequential;


pub use context::{HaltPolicy, ParallelFailurePolicy, RunContext, DEFAULT_HALT_POLICY};
pub use parallel::ParallelEngine;
pub use sequential::SequentialEngine;

use crate::core::{ExecutionMode, PipelineRun};
use crate::errors::Result;
use crate::events::{EventType, LifecycleEvent};
use crate::observability::run_span;
use tracing::{info, Instrument};

/// Executes `run` with the engine matching its mode.
pub async fn execute(ctx: &RunContext, run: &mut PipelineRun) -> Result<()> {
    info!(
        pipeline = %run.pipeline_name,
        run_id = %run.id,
        mode = %run.mode,
        max_workers = run.max_workers,
        steps = run.total_steps(),
        "Run started"
    );
    ctx.executor.events().try_emit(
        LifecycleEvent::run(EventType::RunStarted, &run.pipeline_name, &run.id).with_data(
            serde_json::json!({
                "mode": run.mode.as_str(),
                "max_workers": run.max_workers,
                "order": ctx.graph.topological_order(),
            }),
        ),
    );

    let span = run_span(run);
    async move {
        match run.mode {
            ExecutionMode::Sequential => SequentialEngine::new().execute(ctx, run).await,
            ExecutionMode::Parallel => ParallelEngine::new().execute(ctx, run).await,
        }
    }
    .instrument(span)
    .await
}
