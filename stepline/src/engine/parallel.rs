//! Parallel engine: bounded worker pool driven by readiness.
//!
//! The orchestrating loop is the only place that mutates run state. Workers
//! receive a copy of their step record and hand the finished record back
//! through their join handle; the loop folds it in, recomputes readiness and
//! dispatches whatever became ready.

use super::context::{failure_reason, RunContext};
use super::ParallelFailurePolicy;
use crate::cancellation::CancellationToken;
use crate::core::{PipelineRun, RunStatus, StepRecord, StepStatus};
use crate::errors::{Result, SteplineError};
use crate::executor::StepScope;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, warn};

type InFlight = BoxFuture<'static, (String, std::result::Result<Result<StepRecord>, tokio::task::JoinError>)>;

/// Executes ready steps concurrently, up to the run's `max_workers`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelEngine;

/// How the loop stopped dispatching.
enum Halt {
    Failure(String),
    Cancelled(String),
}

impl ParallelEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs the readiness loop until nothing is pending or the run halts.
    /// The run is finalized before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SteplineError::Deadlock`] when steps remain pending with
    /// nothing ready and nothing in flight. The run is marked failed first.
    pub async fn execute(&self, ctx: &RunContext, run: &mut PipelineRun) -> Result<()> {
        let abort = Arc::new(CancellationToken::new());
        let scope = ctx.scope(run).with_abort(abort.clone());
        let workers = run.max_workers.max(1);

        let mut pending: Vec<String> = ctx
            .graph
            .topological_order()
            .iter()
            .filter(|name| run.step_status(name) == Some(StepStatus::Pending))
            .cloned()
            .collect();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() && ctx.cancel.is_cancelled() {
                debug!(run_id = %run.id, in_flight = in_flight.len(), "Cancellation observed; draining");
                halt = Some(Halt::Cancelled(ctx.cancel_reason()));
            }

            if halt.is_none() {
                let ready = self.resolve_pending(ctx, &scope, run, &mut pending).await?;
                for name in ready {
                    if in_flight.len() >= workers {
                        break;
                    }
                    pending.retain(|p| p != &name);
                    in_flight.push(self.dispatch(ctx, &scope, run, &name));
                }
            }

            if in_flight.is_empty() {
                if halt.is_some() || pending.is_empty() {
                    break;
                }
                return self.deadlock(ctx, run, pending).await;
            }

            let Some((name, joined)) = in_flight.next().await else {
                continue;
            };
            let record = match joined {
                Ok(result) => result?,
                Err(join_error) => {
                    self.worker_lost(ctx, &scope, run, &name, &join_error)
                        .await?
                }
            };
            let failed = record.status == StepStatus::Failed;
            let reason = failure_reason(&record);
            run.steps.insert(name.clone(), record);
            ctx.record_progress(run).await?;

            if failed && !matches!(halt, Some(Halt::Failure(_))) {
                if ctx.failure_policy == ParallelFailurePolicy::CancelSiblings && !in_flight.is_empty() {
                    abort.cancel(format!("sibling step '{name}' failed"));
                }
                halt = Some(Halt::Failure(reason));
            }
        }

        match halt {
            None => ctx.finalize(run, RunStatus::Completed, None).await,
            Some(Halt::Failure(reason)) => {
                ctx.halt(&scope, run, &reason).await?;
                ctx.finalize(run, RunStatus::Failed, Some(reason)).await
            }
            Some(Halt::Cancelled(reason)) => {
                ctx.halt(&scope, run, &reason).await?;
                ctx.finalize(run, RunStatus::Cancelled, Some(reason)).await
            }
        }
    }

    /// One readiness pass over `pending`, in topological order.
    ///
    /// Steps behind a failed or skipped dependency are skipped and steps
    /// with a carried-over outcome are completed on the spot; both leave
    /// `pending`. Returns the steps whose dependencies all completed.
    async fn resolve_pending(
        &self,
        ctx: &RunContext,
        scope: &StepScope,
        run: &mut PipelineRun,
        pending: &mut Vec<String>,
    ) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        let mut resolved = Vec::new();

        for name in pending.iter() {
            match ctx.blocking_dependency(run, name) {
                Some((dependency, status @ (StepStatus::Failed | StepStatus::Skipped))) => {
                    ctx.propagate_skip(scope, run, name, &dependency, status)
                        .await?;
                    resolved.push(name.clone());
                }
                Some(_) => {}
                None => {
                    if ctx.try_carry_over(scope, run, name).await? {
                        resolved.push(name.clone());
                    } else {
                        ready.push(name.clone());
                    }
                }
            }
        }

        pending.retain(|p| !resolved.contains(p));
        debug!(run_id = %run.id, ready = ?ready, pending = pending.len(), "Readiness computed");
        Ok(ready)
    }

    fn dispatch(&self, ctx: &RunContext, scope: &StepScope, run: &PipelineRun, name: &str) -> InFlight {
        let executor = ctx.executor.clone();
        let spec = ctx.graph.step(name).cloned();
        let record = run.step(name).cloned();
        let scope = scope.clone();
        let name = name.to_string();
        let step = name.clone();

        let handle = tokio::spawn(async move {
            match (spec, record) {
                (Some(spec), Some(record)) => executor.execute(&scope, &spec, record).await,
                _ => Err(SteplineError::Internal(format!(
                    "step '{step}' missing from run '{}'",
                    scope.run_id
                ))),
            }
        });
        Box::pin(async move { (name, handle.await) })
    }

    /// Records a step whose worker task panicked as failed.
    async fn worker_lost(
        &self,
        ctx: &RunContext,
        scope: &StepScope,
        run: &PipelineRun,
        name: &str,
        join_error: &tokio::task::JoinError,
    ) -> Result<StepRecord> {
        let mut record = run
            .step(name)
            .cloned()
            .ok_or_else(|| SteplineError::Internal(format!("unknown step '{name}'")))?;
        let reason = format!("worker task ended abnormally: {join_error}");
        warn!(run_id = %run.id, step = %name, error = %join_error, "Step worker lost");
        record.transition(StepStatus::Failed);
        record.error = Some(reason.clone());
        ctx.executor.store().update_step(&record).await?;
        ctx.executor.system_log(scope, name, &reason).await?;
        Ok(record)
    }

    async fn deadlock(&self, ctx: &RunContext, run: &mut PipelineRun, pending: Vec<String>) -> Result<()> {
        let err = SteplineError::Deadlock {
            run_id: run.id.clone(),
            pending,
        };
        error!(pipeline = %run.pipeline_name, run_id = %run.id, error = %err, "Scheduling deadlock");
        ctx.finalize(run, RunStatus::Failed, Some(err.to_string()))
            .await?;
        Err(err)
    }
}
