//! The run controller: public entry point of the engine.
//!
//! [`RunController`] resolves pipelines from the catalog, builds their
//! graphs, persists runs and hands them to the matching engine. It also
//! owns the [`Scheduler`] and the registry of live runs used for
//! cancellation.

mod registry;

pub use registry::RunRegistry;

use crate::condition::{ConditionEvaluator, LiteralConditionEvaluator};
use crate::config::{EngineConfig, RunOptions};
use crate::core::{
    ExecutionMode, PipelineRun, RunReport, RunStatus, ScheduleRecord, ScheduleSpec, StepRecord,
    StepStatus,
};
use crate::engine::{self, RunContext};
use crate::errors::{ConfigError, Result, SteplineError};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::{CommandTaskRunner, StepExecutor, TaskRunner};
use crate::pipeline::{PipelineCatalog, PipelineDefinition, PipelineGraph};
use crate::scheduler::{RunLauncher, Scheduler};
use crate::store::{HistoryFilter, LogEntry, LogFilter, LogFollower, RunStore, RunSummary};
use crate::utils::generate_run_id;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Executes runs. Shared by the controller and the scheduler.
#[derive(Debug)]
struct Orchestrator {
    catalog: Arc<PipelineCatalog>,
    store: RunStore,
    executor: Arc<StepExecutor>,
    registry: RunRegistry,
    config: EngineConfig,
}

impl Orchestrator {
    async fn run_pipeline(&self, name: &str, options: &RunOptions) -> Result<RunReport> {
        let definition = self.catalog.get(name)?;
        let graph = Arc::new(PipelineGraph::build(&definition)?);
        let run = self.new_run(&definition, &graph, options)?;

        if options.dry_run {
            return Ok(dry_run_report(run, &graph));
        }
        self.execute(graph, run, BTreeMap::new()).await
    }

    async fn retry_failed(&self, name: &str, all_steps: bool) -> Result<RunReport> {
        let definition = self.catalog.get(name)?;
        let graph = Arc::new(PipelineGraph::build(&definition)?);
        let Some(failed) = self
            .store
            .latest_run_with_status(name, RunStatus::Failed)
            .await?
        else {
            if all_steps {
                return self.run_pipeline(name, &RunOptions::default()).await;
            }
            return Err(SteplineError::NoFailedRun(name.to_string()));
        };

        let carry_over: BTreeMap<String, StepRecord> = if all_steps {
            BTreeMap::new()
        } else {
            self.store
                .completed_steps(&failed.id)
                .await?
                .into_iter()
                .filter(|step| graph.contains(&step.name))
                .map(|step| (step.name.clone(), step))
                .collect()
        };
        info!(
            pipeline = %name,
            failed_run = %failed.id,
            all_steps,
            carried_over = carry_over.len(),
            "Retrying failed run"
        );

        let options = RunOptions {
            mode: Some(failed.mode),
            max_workers: Some(failed.max_workers),
            dry_run: false,
        };
        let run = self.new_run(&definition, &graph, &options)?;
        self.execute(graph, run, carry_over).await
    }

    fn new_run(
        &self,
        definition: &PipelineDefinition,
        graph: &PipelineGraph,
        options: &RunOptions,
    ) -> Result<PipelineRun> {
        let mode = options
            .mode
            .or(definition.mode)
            .unwrap_or(ExecutionMode::Sequential);
        let max_workers = options
            .max_workers
            .or(definition.max_workers)
            .unwrap_or(self.config.default_max_workers);
        if max_workers == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "max_workers".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let mut run = PipelineRun::new(
            generate_run_id(&definition.name),
            &definition.name,
            mode,
            max_workers,
        );
        for spec in graph.steps() {
            run.add_step(&spec.name, &spec.task);
        }
        Ok(run)
    }

    async fn execute(
        &self,
        graph: Arc<PipelineGraph>,
        mut run: PipelineRun,
        carry_over: BTreeMap<String, StepRecord>,
    ) -> Result<RunReport> {
        let planned_order = graph.topological_order().to_vec();
        self.store
            .begin_run(&run, &planned_order, &graph.edges())
            .await?;

        let cancel = self.registry.register(&run.id, &run.pipeline_name);
        let ctx = RunContext::new(graph, self.executor.clone())
            .with_cancel(cancel)
            .with_halt_policy(self.config.halt_policy)
            .with_failure_policy(self.config.parallel_failure_policy)
            .with_carry_over(carry_over);

        let outcome = engine::execute(&ctx, &mut run).await;
        self.registry.deregister(&run.id);

        if let Err(err) = outcome {
            if run.status == RunStatus::Running {
                run.finish(RunStatus::Failed, Some(err.to_string()));
                if let Err(store_err) = self.store.finish_run(&run).await {
                    warn!(run_id = %run.id, error = %store_err, "Failed to record aborted run");
                }
            }
            return Err(err);
        }

        Ok(RunReport {
            run,
            dry_run: false,
            planned_order,
        })
    }
}

fn dry_run_report(run: PipelineRun, graph: &PipelineGraph) -> RunReport {
    for (position, name) in graph.topological_order().iter().enumerate() {
        let task = graph.step(name).map_or("", |s| s.task.as_str());
        let deps = graph.dependencies_of(name);
        info!(
            pipeline = %run.pipeline_name,
            position = position + 1,
            step = %name,
            task = %task,
            depends_on = ?deps,
            "[dry run] would execute step"
        );
    }
    RunReport {
        planned_order: graph.topological_order().to_vec(),
        run,
        dry_run: true,
    }
}

#[async_trait]
impl RunLauncher for Orchestrator {
    async fn launch(&self, pipeline: &str, schedule_id: &str) -> Result<()> {
        let report = self.run_pipeline(pipeline, &RunOptions::default()).await?;
        info!(
            schedule_id = %schedule_id,
            pipeline = %pipeline,
            run_id = %report.run_id(),
            status = %report.status(),
            "Scheduled run finished"
        );
        Ok(())
    }
}

/// Builder for [`RunController`].
#[must_use]
pub struct RunControllerBuilder {
    catalog: PipelineCatalog,
    store: RunStore,
    config: EngineConfig,
    runner: Option<Arc<dyn TaskRunner>>,
    conditions: Arc<dyn ConditionEvaluator>,
    events: Arc<dyn EventSink>,
}

impl RunControllerBuilder {
    /// Starts a builder over an open store.
    pub fn new(catalog: PipelineCatalog, store: RunStore) -> Self {
        Self {
            catalog,
            store,
            config: EngineConfig::default(),
            runner: None,
            conditions: Arc::new(LiteralConditionEvaluator::new()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `runner` instead of the process runner from the configuration.
    pub fn runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Sets the condition evaluator.
    pub fn conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Sets the lifecycle event sink.
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds the controller. The scheduler stays stopped until
    /// [`RunController::start`].
    pub fn build(self) -> Result<RunController> {
        self.config.validate()?;
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(CommandTaskRunner::new(self.config.runner.clone())));
        let executor = Arc::new(StepExecutor::new(
            runner,
            self.conditions,
            self.store.clone(),
            self.events,
        ));
        let orchestrator = Arc::new(Orchestrator {
            catalog: Arc::new(self.catalog),
            store: self.store.clone(),
            executor,
            registry: RunRegistry::new(),
            config: self.config,
        });
        let scheduler = Scheduler::new(self.store, orchestrator.clone());

        Ok(RunController {
            orchestrator,
            scheduler,
        })
    }
}

/// Public façade over catalog, engines, store and scheduler.
#[derive(Debug)]
pub struct RunController {
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
}

impl RunController {
    /// Starts a builder.
    pub fn builder(catalog: PipelineCatalog, store: RunStore) -> RunControllerBuilder {
        RunControllerBuilder::new(catalog, store)
    }

    /// Opens the store named by `config` and builds a controller that runs
    /// tasks through the process runner.
    pub async fn connect(config: EngineConfig, catalog: PipelineCatalog) -> Result<Self> {
        config.validate()?;
        let store = RunStore::connect(&config.database_url, config.store_max_connections).await?;
        Self::builder(catalog, store).config(config).build()
    }

    /// Recovers runs interrupted by a previous process, then re-arms the
    /// persisted schedules. Returns the ids of the recovered runs.
    pub async fn start(&self) -> Result<Vec<String>> {
        let recovered = self.orchestrator.store.recover_interrupted_runs().await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered interrupted runs");
        }
        self.scheduler.start().await?;
        Ok(recovered)
    }

    /// Stops the scheduler. Runs in progress are not affected.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Runs a pipeline to completion.
    ///
    /// A run that ends `failed` or `cancelled` is still `Ok`; inspect the
    /// report. `Err` means the run could not be started (configuration,
    /// store) or hit a scheduling deadlock.
    pub async fn run_pipeline(&self, name: &str, options: RunOptions) -> Result<RunReport> {
        self.orchestrator.run_pipeline(name, &options).await
    }

    /// Requests cancellation of a live run by id, or of every live run of a
    /// pipeline by name. Returns false if nothing matched.
    pub fn cancel_pipeline(&self, run_id_or_name: &str) -> bool {
        self.orchestrator
            .registry
            .cancel(run_id_or_name, "cancelled by request")
    }

    /// Reruns a pipeline after a failure.
    ///
    /// The new run reuses the mode and worker count of the most recent
    /// failed run. Without `all_steps`, steps that completed in that run are
    /// carried over and everything else executes again. With `all_steps`
    /// every step executes, and a pipeline that never failed simply runs
    /// with its defaults.
    pub async fn retry_failed_pipeline(&self, name: &str, all_steps: bool) -> Result<RunReport> {
        self.orchestrator.retry_failed(name, all_steps).await
    }

    /// Returns true while the run is executing in this process.
    #[must_use]
    pub fn is_running(&self, run_id: &str) -> bool {
        self.orchestrator.registry.is_running(run_id)
    }

    /// Registers a schedule for a known pipeline.
    pub async fn schedule_pipeline(&self, name: &str, spec: ScheduleSpec) -> Result<ScheduleRecord> {
        self.orchestrator.catalog.get(name)?;
        self.scheduler.schedule(name, spec).await
    }

    /// Removes the schedule with id `key`, or every active schedule of the
    /// pipeline named `key`. Returns the removed schedule ids.
    pub async fn unschedule_pipeline(&self, key: &str) -> Result<Vec<String>> {
        self.scheduler.unschedule(key).await
    }

    /// Persisted schedules, oldest first.
    pub async fn get_scheduled_pipelines(&self, active_only: bool) -> Result<Vec<ScheduleRecord>> {
        self.scheduler.list(active_only).await
    }

    /// Run history, newest first.
    pub async fn get_pipeline_history(&self, filter: &HistoryFilter) -> Result<Vec<RunSummary>> {
        self.orchestrator.store.list_runs(filter).await
    }

    /// One stored run with its step records.
    pub async fn get_run(&self, run_id: &str) -> Result<PipelineRun> {
        self.orchestrator
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| SteplineError::RunNotFound(run_id.to_string()))
    }

    /// Log lines, oldest first.
    pub async fn get_pipeline_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        self.orchestrator.store.query_logs(filter).await
    }

    /// A cursor returning only lines written since its previous poll.
    #[must_use]
    pub fn follow_logs(&self, filter: LogFilter) -> LogFollower {
        self.orchestrator.store.follow(filter)
    }

    /// Deletes every log line. Returns how many were removed.
    pub async fn clear_logs(&self) -> Result<u64> {
        let removed = self.orchestrator.store.clear_logs().await?;
        info!(removed, "Logs cleared");
        Ok(removed)
    }

    /// Names of the known pipelines, sorted.
    #[must_use]
    pub fn list_pipelines(&self) -> Vec<String> {
        self.orchestrator.catalog.names()
    }

    /// One pipeline definition.
    pub fn get_pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        Ok(self.orchestrator.catalog.get(name)?)
    }

    /// Renders a pipeline graph in Graphviz DOT, coloured by the step
    /// statuses of `run_id` when given.
    pub async fn visualize_pipeline(&self, name: &str, run_id: Option<&str>) -> Result<String> {
        let graph = self.orchestrator.catalog.graph(name)?;
        let Some(run_id) = run_id else {
            return Ok(graph.to_dot(None));
        };

        let steps = self.orchestrator.store.list_steps(run_id).await?;
        if steps.is_empty() && self.orchestrator.store.get_run(run_id).await?.is_none() {
            return Err(SteplineError::RunNotFound(run_id.to_string()));
        }
        let statuses: HashMap<String, StepStatus> =
            steps.into_iter().map(|s| (s.name, s.status)).collect();
        Ok(graph.to_dot(Some(&statuses)))
    }

    /// The run store.
    #[must_use]
    pub fn store(&self) -> &RunStore {
        &self.orchestrator.store
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogType;
    use crate::pipeline::StepSpec;
    use crate::store::INTERRUPTED_REASON;
    use crate::testing::{ScriptedOutcome, ScriptedTaskRunner};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn catalog() -> PipelineCatalog {
        PipelineCatalog::new()
            .with_pipeline(
                PipelineDefinition::new("deploy")
                    .step(StepSpec::new("build", "ci.build"))
                    .step(StepSpec::new("test", "ci.test"))
                    .step(StepSpec::new("publish", "ci.publish")),
            )
            .unwrap()
    }

    async fn controller(runner: ScriptedTaskRunner) -> RunController {
        let store = RunStore::in_memory().await.unwrap();
        RunController::builder(catalog(), store)
            .runner(Arc::new(runner))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_persists_history() {
        let runner = ScriptedTaskRunner::new();
        let ctl = controller(runner.clone()).await;

        let report = ctl.run_pipeline("deploy", RunOptions::new()).await.unwrap();
        assert!(report.succeeded());
        assert!(!ctl.is_running(report.run_id()));

        let history = ctl
            .get_pipeline_history(&HistoryFilter::new().pipeline("deploy"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
        assert!((history[0].progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(history[0].total_steps, 3);
        assert_eq!(history[0].completed_steps, 3);

        let stored = ctl.get_run(report.run_id()).await.unwrap();
        assert_eq!(stored.steps.len(), 3);
        assert_eq!(
            ctl.store().list_dependencies(report.run_id()).await.unwrap(),
            vec![
                ("build".to_string(), "test".to_string()),
                ("test".to_string(), "publish".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_config_error() {
        let ctl = controller(ScriptedTaskRunner::new()).await;
        let err = ctl.run_pipeline("nope", RunOptions::new()).await.unwrap_err();
        assert!(err.is_configuration());

        let err = ctl
            .schedule_pipeline("nope", ScheduleSpec::every(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_dry_run_executes_and_persists_nothing() {
        let runner = ScriptedTaskRunner::new();
        let ctl = controller(runner.clone()).await;

        let report = ctl
            .run_pipeline("deploy", RunOptions::new().dry_run())
            .await
            .unwrap();

        assert!(report.dry_run);
        assert!(report.succeeded());
        assert_eq!(report.planned_order, vec!["build", "test", "publish"]);
        assert_eq!(runner.total_invocations(), 0);
        assert!(ctl
            .get_pipeline_history(&HistoryFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_carries_over_completed_steps() {
        let runner = ScriptedTaskRunner::new().with_sequence(
            "ci.test",
            vec![ScriptedOutcome::failure(1, "flaky test")],
        );
        let ctl = controller(runner.clone()).await;

        let first = ctl.run_pipeline("deploy", RunOptions::new()).await.unwrap();
        assert_eq!(first.status(), RunStatus::Failed);

        let retry = ctl.retry_failed_pipeline("deploy", false).await.unwrap();
        assert!(retry.succeeded());
        assert_ne!(retry.run_id(), first.run_id());
        assert_eq!(runner.invocation_count("ci.build"), 1);
        assert_eq!(runner.invocation_count("ci.test"), 2);
        assert_eq!(runner.invocation_count("ci.publish"), 1);

        let logs = ctl
            .get_pipeline_logs(
                &LogFilter::new()
                    .run(retry.run_id())
                    .step("build")
                    .log_type(LogType::System),
            )
            .await
            .unwrap();
        assert!(logs[0].message.contains(first.run_id()));
    }

    #[tokio::test]
    async fn test_retry_all_steps_reuses_failed_run_settings() {
        let runner = ScriptedTaskRunner::new().with_sequence(
            "ci.test",
            vec![ScriptedOutcome::failure(1, "flaky test")],
        );
        let ctl = controller(runner.clone()).await;

        let first = ctl
            .run_pipeline("deploy", RunOptions::new().parallel(3))
            .await
            .unwrap();
        assert_eq!(first.status(), RunStatus::Failed);

        let retry = ctl.retry_failed_pipeline("deploy", true).await.unwrap();
        assert!(retry.succeeded());
        assert_eq!(retry.run.mode, ExecutionMode::Parallel);
        assert_eq!(retry.run.max_workers, 3);
        assert_eq!(runner.invocation_count("ci.build"), 2);
        assert_eq!(runner.invocation_count("ci.test"), 2);
    }

    #[tokio::test]
    async fn test_retry_without_failed_run() {
        let ctl = controller(ScriptedTaskRunner::new()).await;
        let err = ctl.retry_failed_pipeline("deploy", false).await.unwrap_err();
        assert!(matches!(err, SteplineError::NoFailedRun(_)));

        let fresh = ctl.retry_failed_pipeline("deploy", true).await.unwrap();
        assert!(fresh.succeeded());
    }

    #[tokio::test]
    async fn test_cancel_running_pipeline_by_name() {
        let runner = ScriptedTaskRunner::new().with_outcome(
            "ci.build",
            ScriptedOutcome::success("").with_delay(Duration::from_millis(200)),
        );
        let ctl = Arc::new(controller(runner.clone()).await);

        let background = ctl.clone();
        let handle =
            tokio::spawn(async move { background.run_pipeline("deploy", RunOptions::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(ctl.cancel_pipeline("deploy"));
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.status(), RunStatus::Cancelled);
        assert_eq!(report.step("build").unwrap().status, StepStatus::Completed);
        assert_eq!(runner.total_invocations(), 1);
        assert!(!ctl.cancel_pipeline("deploy"));
    }

    #[tokio::test]
    async fn test_start_recovers_interrupted_runs() {
        let ctl = controller(ScriptedTaskRunner::new()).await;
        let mut run = PipelineRun::new("stale", "deploy", ExecutionMode::Sequential, 1);
        run.add_step("build", "ci.build");
        ctl.store()
            .begin_run(&run, &["build".to_string()], &[])
            .await
            .unwrap();
        let mut step = run.step("build").unwrap().clone();
        step.transition(StepStatus::Running);
        ctl.store().update_step(&step).await.unwrap();

        let recovered = ctl.start().await.unwrap();
        assert_eq!(recovered, vec!["stale".to_string()]);

        let stored = ctl.get_run("stale").await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(stored.step_status("build"), Some(StepStatus::Failed));
        ctl.stop();
    }

    #[tokio::test]
    async fn test_visualize_with_run_statuses() {
        let runner =
            ScriptedTaskRunner::new().with_outcome("ci.test", ScriptedOutcome::failure(1, "no"));
        let ctl = controller(runner).await;
        let report = ctl.run_pipeline("deploy", RunOptions::new()).await.unwrap();

        let plain = ctl.visualize_pipeline("deploy", None).await.unwrap();
        assert!(plain.starts_with("digraph"));

        let coloured = ctl
            .visualize_pipeline("deploy", Some(report.run_id()))
            .await
            .unwrap();
        assert!(coloured.contains("lightcoral"));
        assert!(coloured.contains("palegreen"));

        let err = ctl.visualize_pipeline("deploy", Some("missing")).await.unwrap_err();
        assert!(matches!(err, SteplineError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let runner = ScriptedTaskRunner::new().with_outcome("ci.build", ScriptedOutcome::success("hi"));
        let ctl = controller(runner).await;
        ctl.run_pipeline("deploy", RunOptions::new()).await.unwrap();

        assert!(ctl.clear_logs().await.unwrap() >= 1);
        assert!(ctl
            .get_pipeline_logs(&LogFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_catalog_accessors() {
        let ctl = controller(ScriptedTaskRunner::new()).await;
        assert_eq!(ctl.list_pipelines(), vec!["deploy".to_string()]);
        assert_eq!(ctl.get_pipeline("deploy").unwrap().steps.len(), 3);
        assert!(ctl.get_pipeline("nope").is_err());
    }
}
