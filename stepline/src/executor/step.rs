//! The step executor.
//!
//! Runs one step: condition check, retry loop, per-attempt timeout and
//! output capture. Every transition, attempt and output line is written to
//! the run store as it happens.

use super::{OutputSink, TaskOutput, TaskRequest, TaskRunner};
use crate::cancellation::CancellationToken;
use crate::condition::{ConditionContext, ConditionEvaluator};
use crate::core::{tail, LogType, StepRecord, StepStatus};
use crate::errors::{Result, TaskError};
use crate::events::{EventSink, EventType, LifecycleEvent};
use crate::pipeline::StepSpec;
use crate::store::RunStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit code recorded when an attempt exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when an attempt is aborted because a sibling failed.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Exit code recorded when a condition cannot be evaluated.
pub const CONDITION_ERROR_EXIT_CODE: i32 = 1;

/// Identifies the run a step executes in.
#[derive(Debug, Clone)]
pub struct StepScope {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: String,
    /// Cancelling this token aborts in-flight attempts.
    pub abort: Arc<CancellationToken>,
}

impl StepScope {
    /// Creates a scope whose attempts are never aborted.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            run_id: run_id.into(),
            abort: Arc::new(CancellationToken::new()),
        }
    }

    /// Uses `abort` to cut in-flight attempts short.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<CancellationToken>) -> Self {
        self.abort = abort;
        self
    }
}

/// Outcome of a single attempt.
enum Attempt {
    Succeeded(TaskOutput),
    Failed {
        exit_code: i32,
        stdout: String,
        stderr: String,
        reason: String,
    },
    Aborted {
        stdout: String,
        stderr: String,
    },
}

/// Executes steps through a [`TaskRunner`].
pub struct StepExecutor {
    runner: Arc<dyn TaskRunner>,
    conditions: Arc<dyn ConditionEvaluator>,
    store: RunStore,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        conditions: Arc<dyn ConditionEvaluator>,
        store: RunStore,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            runner,
            conditions,
            store,
            events,
        }
    }

    /// The store this executor writes to.
    #[must_use]
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// The event sink this executor emits to.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs `spec` and returns its terminal record.
    ///
    /// Task failures never surface as errors; they end in a `failed`
    /// record. Only run store failures are returned as `Err`.
    pub async fn execute(
        &self,
        scope: &StepScope,
        spec: &StepSpec,
        mut record: StepRecord,
    ) -> Result<StepRecord> {
        if let Some(expression) = &spec.condition {
            let ctx = ConditionContext::new(&scope.pipeline, &scope.run_id, &spec.name);
            match self.conditions.evaluate(expression, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    self.skip(
                        scope,
                        &mut record,
                        format!("condition '{expression}' evaluated false"),
                    )
                    .await?;
                    return Ok(record);
                }
                Err(err) => {
                    let reason = format!("error evaluating condition '{expression}': {err:#}");
                    record.exit_code = Some(CONDITION_ERROR_EXIT_CODE);
                    record.stderr.clone_from(&reason);
                    record.transition(StepStatus::Failed);
                    record.error = Some(reason.clone());
                    self.finish_failed(scope, &record, &reason).await?;
                    return Ok(record);
                }
            }
        }

        record.transition(StepStatus::Running);
        self.store.update_step(&record).await?;
        self.emit(scope, EventType::StepStarted, &record.name, None);
        info!(
            pipeline = %scope.pipeline,
            run_id = %scope.run_id,
            step = %record.name,
            task = %spec.task,
            "Step started"
        );

        let max_attempts = spec.retry.effective_attempts();
        loop {
            record.attempt += 1;
            self.store.update_step(&record).await?;

            let attempt = record.attempt;
            match self.run_attempt(scope, spec, attempt).await {
                Attempt::Succeeded(output) => {
                    record.stdout = output.stdout;
                    record.stderr = output.stderr;
                    record.exit_code = Some(0);
                    record.error = None;
                    record.transition(StepStatus::Completed);
                    self.store.update_step(&record).await?;
                    self.emit(
                        scope,
                        EventType::StepCompleted,
                        &record.name,
                        Some(serde_json::json!({ "attempt": attempt })),
                    );
                    info!(
                        pipeline = %scope.pipeline,
                        run_id = %scope.run_id,
                        step = %record.name,
                        attempt,
                        "Step completed"
                    );
                    return Ok(record);
                }
                Attempt::Aborted { stdout, stderr } => {
                    let reason = scope
                        .abort
                        .reason()
                        .unwrap_or_else(|| "aborted".to_string());
                    record.stdout = stdout;
                    record.stderr = stderr;
                    record.exit_code = Some(CANCELLED_EXIT_CODE);
                    record.error = Some(format!("cancelled: {reason}"));
                    record.transition(StepStatus::Failed);
                    self.finish_failed(scope, &record, &format!("cancelled: {reason}"))
                        .await?;
                    return Ok(record);
                }
                Attempt::Failed {
                    exit_code,
                    stdout,
                    stderr,
                    reason,
                } => {
                    record.stdout = stdout;
                    record.stderr = stderr;
                    record.exit_code = Some(exit_code);
                    record.error = Some(reason.clone());

                    if !spec.retry.has_attempts_after(attempt) {
                        record.transition(StepStatus::Failed);
                        self.finish_failed(scope, &record, &reason).await?;
                        return Ok(record);
                    }

                    let delay = spec.retry.delay_after(attempt);
                    self.store.update_step(&record).await?;
                    self.system_log(
                        scope,
                        &record.name,
                        &format!(
                            "attempt {attempt}/{max_attempts} failed ({reason}); retrying in {:.3}s",
                            delay.as_secs_f64()
                        ),
                    )
                    .await?;
                    self.emit(
                        scope,
                        EventType::StepRetrying,
                        &record.name,
                        Some(serde_json::json!({
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                            "exit_code": exit_code,
                            "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        })),
                    );
                    debug!(
                        run_id = %scope.run_id,
                        step = %record.name,
                        attempt,
                        exit_code,
                        delay_ms = delay.as_millis(),
                        "Retrying step after backoff"
                    );

                    if !self.backoff(scope, delay).await {
                        let reason = scope
                            .abort
                            .reason()
                            .unwrap_or_else(|| "aborted".to_string());
                        record.exit_code = Some(CANCELLED_EXIT_CODE);
                        record.error = Some(format!("cancelled: {reason}"));
                        record.transition(StepStatus::Failed);
                        self.finish_failed(scope, &record, &format!("cancelled: {reason}"))
                            .await?;
                        return Ok(record);
                    }
                }
            }
        }
    }

    /// Marks a pending step skipped, persists it and logs the reason.
    pub async fn skip(
        &self,
        scope: &StepScope,
        record: &mut StepRecord,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        if !record.skip(reason.clone()) {
            return Ok(());
        }
        self.store.update_step(record).await?;
        self.system_log(scope, &record.name, &format!("skipped: {reason}"))
            .await?;
        self.emit(
            scope,
            EventType::StepSkipped,
            &record.name,
            Some(serde_json::json!({ "reason": reason })),
        );
        info!(
            pipeline = %scope.pipeline,
            run_id = %scope.run_id,
            step = %record.name,
            reason = %reason,
            "Step skipped"
        );
        Ok(())
    }

    /// Marks a pending step completed using the outcome of an earlier run.
    pub async fn carry_over(
        &self,
        scope: &StepScope,
        record: &mut StepRecord,
        previous: &StepRecord,
    ) -> Result<()> {
        if !record.transition(StepStatus::Completed) {
            return Ok(());
        }
        record.attempt = previous.attempt;
        record.exit_code = previous.exit_code;
        record.stdout.clone_from(&previous.stdout);
        record.stderr.clone_from(&previous.stderr);
        self.store.update_step(record).await?;
        self.system_log(
            scope,
            &record.name,
            &format!("completed in run '{}'; not re-executed", previous.run_id),
        )
        .await?;
        self.emit(
            scope,
            EventType::StepCompleted,
            &record.name,
            Some(serde_json::json!({ "carried_over_from": previous.run_id })),
        );
        Ok(())
    }

    /// Writes a `system` log line for a step.
    pub async fn system_log(&self, scope: &StepScope, step: &str, message: &str) -> Result<()> {
        self.store
            .append_log(
                &scope.run_id,
                &scope.pipeline,
                Some(step),
                LogType::System,
                message,
            )
            .await?;
        Ok(())
    }

    async fn run_attempt(&self, scope: &StepScope, spec: &StepSpec, attempt: u32) -> Attempt {
        let request = TaskRequest {
            pipeline: scope.pipeline.clone(),
            run_id: scope.run_id.clone(),
            step: spec.name.clone(),
            task: spec.task.clone(),
            args: spec.args.clone(),
            attempt,
        };
        let sink = StoreOutputSink::new(&self.store, scope, &spec.name);
        let limit = spec.timeout();

        let finished = {
            let invocation = self.runner.run(&request, &sink);
            let bounded = async {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, invocation).await.ok(),
                    None => Some(invocation.await),
                }
            };
            tokio::select! {
                biased;
                () = scope.abort.cancelled() => None,
                result = bounded => Some(result),
            }
        };

        match finished {
            None => {
                let (stdout, stderr) = sink.take();
                Attempt::Aborted { stdout, stderr }
            }
            Some(None) => {
                let (stdout, stderr) = sink.take();
                let secs = limit.map_or(0.0, |l| l.as_secs_f64());
                warn!(
                    run_id = %scope.run_id,
                    step = %spec.name,
                    attempt,
                    timeout_secs = secs,
                    "Step attempt timed out"
                );
                Attempt::Failed {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout,
                    stderr,
                    reason: format!("timed out after {secs}s"),
                }
            }
            Some(Some(Ok(output))) => Attempt::Succeeded(output),
            Some(Some(Err(err))) => {
                let (streamed_out, streamed_err) = sink.take();
                let exit_code = err.exit_code();
                let (stdout, stderr) = match err {
                    TaskError::NonZeroExit { stdout, stderr, .. } => (stdout, stderr),
                    other => (streamed_out, format!("{streamed_err}{other}")),
                };
                let reason = failure_reason(exit_code, &stderr);
                Attempt::Failed {
                    exit_code,
                    stdout,
                    stderr,
                    reason,
                }
            }
        }
    }

    /// Sleeps for `delay` unless the scope is aborted first. Returns false
    /// when aborted.
    async fn backoff(&self, scope: &StepScope, delay: Duration) -> bool {
        if delay.is_zero() {
            return !scope.abort.is_cancelled();
        }
        tokio::select! {
            biased;
            () = scope.abort.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn finish_failed(&self, scope: &StepScope, record: &StepRecord, reason: &str) -> Result<()> {
        self.store.update_step(record).await?;
        self.system_log(
            scope,
            &record.name,
            &format!("failed after {} attempt(s): {reason}", record.attempt),
        )
        .await?;
        self.emit(
            scope,
            EventType::StepFailed,
            &record.name,
            Some(serde_json::json!({
                "attempt": record.attempt,
                "exit_code": record.exit_code,
                "error": reason,
            })),
        );
        warn!(
            pipeline = %scope.pipeline,
            run_id = %scope.run_id,
            step = %record.name,
            attempt = record.attempt,
            exit_code = ?record.exit_code,
            error = %reason,
            "Step failed"
        );
        Ok(())
    }

    fn emit(
        &self,
        scope: &StepScope,
        event_type: EventType,
        step: &str,
        data: Option<serde_json::Value>,
    ) {
        let mut event = LifecycleEvent::step(event_type, &scope.pipeline, &scope.run_id, step);
        event.data = data;
        self.events.try_emit(event);
    }
}

fn failure_reason(exit_code: i32, stderr: &str) -> String {
    let tail = tail(stderr.trim_end());
    if tail.is_empty() {
        format!("exited with code {exit_code}")
    } else {
        format!("exited with code {exit_code}: {tail}")
    }
}

/// Streams task output into the log table and keeps a copy of each stream.
struct StoreOutputSink<'a> {
    store: &'a RunStore,
    scope: &'a StepScope,
    step: &'a str,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl<'a> StoreOutputSink<'a> {
    fn new(store: &'a RunStore, scope: &'a StepScope, step: &'a str) -> Self {
        Self {
            store,
            scope,
            step,
            stdout: Mutex::new(String::new()),
            stderr: Mutex::new(String::new()),
        }
    }

    fn take(&self) -> (String, String) {
        (
            std::mem::take(&mut *self.stdout.lock()),
            std::mem::take(&mut *self.stderr.lock()),
        )
    }
}

#[async_trait]
impl OutputSink for StoreOutputSink<'_> {
    async fn line(&self, log_type: LogType, line: &str) {
        {
            let mut buffer = match log_type {
                LogType::Stderr => self.stderr.lock(),
                _ => self.stdout.lock(),
            };
            buffer.push_str(line);
            buffer.push('\n');
        }

        if let Err(err) = self
            .store
            .append_log(
                &self.scope.run_id,
                &self.scope.pipeline,
                Some(self.step),
                log_type,
                line,
            )
            .await
        {
            warn!(
                run_id = %self.scope.run_id,
                step = %self.step,
                error = %err,
                "Failed to persist output line"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{LiteralConditionEvaluator, MockConditionEvaluator};
    use crate::core::{ExecutionMode, PipelineRun};
    use crate::events::CollectingEventSink;
    use crate::pipeline::RetryPolicy;
    use crate::store::LogFilter;
    use crate::testing::{ScriptedOutcome, ScriptedTaskRunner};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    struct Harness {
        executor: StepExecutor,
        runner: Arc<ScriptedTaskRunner>,
        events: Arc<CollectingEventSink>,
        store: RunStore,
        scope: StepScope,
        record: StepRecord,
    }

    async fn harness(runner: ScriptedTaskRunner, conditions: Arc<dyn ConditionEvaluator>) -> Harness {
        let store = RunStore::in_memory().await.unwrap();
        let mut run = PipelineRun::new("r1", "deploy", ExecutionMode::Sequential, 1);
        run.add_step("build", "ci.build");
        store
            .begin_run(&run, &["build".to_string()], &[])
            .await
            .unwrap();

        let runner = Arc::new(runner);
        let events = Arc::new(CollectingEventSink::new());
        let executor = StepExecutor::new(runner.clone(), conditions, store.clone(), events.clone());
        let record = run.step("build").unwrap().clone();

        Harness {
            executor,
            runner,
            events,
            store,
            scope: StepScope::new("deploy", "r1"),
            record,
        }
    }

    fn literal() -> Arc<dyn ConditionEvaluator> {
        Arc::new(LiteralConditionEvaluator::new())
    }

    #[tokio::test]
    async fn test_success_persists_output() {
        let runner = ScriptedTaskRunner::new()
            .with_outcome("ci.build", ScriptedOutcome::success("compiled"));
        let h = harness(runner, literal()).await;

        let spec = StepSpec::new("build", "ci.build");
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout, "compiled\n");

        let stored = h.store.get_step("r1", "build").await.unwrap().unwrap();
        assert_eq!(stored, record);

        let logs = h.store.query_logs(&LogFilter::new().run("r1")).await.unwrap();
        assert_eq!(logs[0].message, "compiled");
        assert_eq!(logs[0].log_type, LogType::Stdout);

        assert_eq!(
            h.events.step_timeline("build"),
            vec![EventType::StepStarted, EventType::StepCompleted]
        );
    }

    #[tokio::test]
    async fn test_retry_invokes_exactly_max_attempts_with_backoff() {
        let runner =
            ScriptedTaskRunner::new().with_outcome("ci.build", ScriptedOutcome::failure(2, "nope"));
        let h = harness(runner, literal()).await;

        let spec = StepSpec::new("build", "ci.build")
            .with_retry(RetryPolicy::attempts(3, Duration::from_millis(100)));
        let started = Instant::now();
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempt, 3);
        assert_eq!(record.exit_code, Some(2));
        assert_eq!(h.runner.invocation_count("ci.build"), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(record.error.as_deref().unwrap().contains("nope"));

        let calls = h.runner.invocations();
        for pair in calls.windows(2) {
            assert!(pair[1].started - pair[0].finished.unwrap() >= Duration::from_millis(100));
        }
        assert_eq!(h.events.events_of_type(EventType::StepRetrying).len(), 2);

        let system = h
            .store
            .query_logs(&LogFilter::new().run("r1").log_type(LogType::System))
            .await
            .unwrap();
        assert_eq!(system.len(), 3);
        assert!(system[2].message.starts_with("failed after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let runner = ScriptedTaskRunner::new().with_sequence(
            "ci.build",
            vec![ScriptedOutcome::failure(1, "flaky"), ScriptedOutcome::success("ok")],
        );
        let h = harness(runner, literal()).await;

        let spec = StepSpec::new("build", "ci.build").with_retry(RetryPolicy::attempts(2, Duration::ZERO));
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_with_124() {
        let runner = ScriptedTaskRunner::new().with_outcome(
            "ci.build",
            ScriptedOutcome::success("late").with_delay(Duration::from_secs(10)),
        );
        let h = harness(runner, literal()).await;

        let spec = StepSpec::new("build", "ci.build").with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(record.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_false_condition_skips_without_invoking() {
        let h = harness(ScriptedTaskRunner::new(), literal()).await;

        let spec = StepSpec::new("build", "ci.build").with_condition("false");
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert_eq!(record.status, StepStatus::Skipped);
        assert_eq!(h.runner.invocation_count("ci.build"), 0);
        assert_eq!(h.events.step_timeline("build"), vec![EventType::StepSkipped]);
    }

    #[tokio::test]
    async fn test_condition_error_fails_with_exit_code_one() {
        let mut mock = MockConditionEvaluator::new();
        mock.expect_evaluate()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("undefined variable")));
        let h = harness(ScriptedTaskRunner::new(), Arc::new(mock)).await;

        let spec = StepSpec::new("build", "ci.build").with_condition("env.FLAG");
        let record = h.executor.execute(&h.scope, &spec, h.record).await.unwrap();

        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.exit_code, Some(CONDITION_ERROR_EXIT_CODE));
        assert!(record.stderr.contains("undefined variable"));
        assert_eq!(h.runner.invocation_count("ci.build"), 0);
    }

    #[tokio::test]
    async fn test_abort_cuts_attempt_short() {
        let runner = ScriptedTaskRunner::new().with_outcome(
            "ci.build",
            ScriptedOutcome::success("late").with_delay(Duration::from_secs(10)),
        );
        let h = harness(runner, literal()).await;
        let abort = Arc::new(CancellationToken::new());
        let scope = h.scope.clone().with_abort(abort.clone());

        let spec = StepSpec::new("build", "ci.build")
            .with_retry(RetryPolicy::attempts(5, Duration::ZERO));
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.cancel("sibling step 'lint' failed");
        });

        let record = h.executor.execute(&scope, &spec, h.record).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.exit_code, Some(CANCELLED_EXIT_CODE));
        assert!(record.error.as_deref().unwrap().contains("sibling step 'lint' failed"));
    }

    #[tokio::test]
    async fn test_carry_over_marks_completed() {
        let h = harness(ScriptedTaskRunner::new(), literal()).await;
        let mut previous = StepRecord::new("r0", "build", "ci.build");
        previous.transition(StepStatus::Running);
        previous.attempt = 2;
        previous.exit_code = Some(0);
        previous.transition(StepStatus::Completed);

        let mut record = h.record;
        h.executor.carry_over(&h.scope, &mut record, &previous).await.unwrap();

        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.attempt, 2);
        let logs = h.store.query_logs(&LogFilter::new().run("r1")).await.unwrap();
        assert!(logs[0].message.contains("'r0'"));
    }

    #[test]
    fn test_failure_reason_uses_stderr_tail() {
        assert_eq!(failure_reason(2, ""), "exited with code 2");
        assert_eq!(failure_reason(2, "bad thing\n"), "exited with code 2: bad thing");
    }
}
