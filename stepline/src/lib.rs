//! # Stepline
//!
//! Dependency-aware pipeline orchestration with persistent run history and
//! scheduling.
//!
//! A pipeline is a named set of steps, each invoking a task and declaring
//! which steps it depends on. Stepline provides:
//!
//! - **Graph building**: dependency validation, cycle detection and a
//!   deterministic topological order
//! - **Step execution**: conditions, retries with backoff, timeouts and
//!   streamed output
//! - **Two engines**: sequential, and parallel over a bounded worker pool
//! - **Persistence**: runs, steps, dependency edges and logs in SQLite
//! - **Scheduling**: cron and interval triggers that survive restarts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepline::prelude::*;
//!
//! let catalog = PipelineCatalog::new().with_pipeline(
//!     PipelineDefinition::new("deploy")
//!         .step(StepSpec::new("build", "ci.build"))
//!         .step(StepSpec::new("test", "ci.test"))
//!         .step(StepSpec::new("publish", "ci.publish")),
//! )?;
//!
//! let controller = RunController::connect(EngineConfig::from_env()?, catalog).await?;
//! controller.start().await?;
//!
//! let report = controller.run_pipeline("deploy", RunOptions::new().parallel(2)).await?;
//! assert!(report.succeeded());
//! ```

#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod condition;
pub mod config;
pub mod controller;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::condition::{ConditionContext, ConditionEvaluator, LiteralConditionEvaluator};
    pub use crate::config::{CommandRunnerConfig, EngineConfig, LogFormat, LoggingConfig, RunOptions};
    pub use crate::controller::RunController;
    pub use crate::core::{
        ExecutionMode, LogType, PipelineRun, RunReport, RunStatus, ScheduleRecord, ScheduleSpec,
        ScheduleStatus, StepRecord, StepStatus,
    };
    pub use crate::engine::{HaltPolicy, ParallelFailurePolicy};
    pub use crate::errors::{ConfigError, Result, SteplineError, TaskError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{CommandTaskRunner, OutputSink, TaskOutput, TaskRequest, TaskRunner};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        ArgValue, BackoffStrategy, PipelineCatalog, PipelineDefinition, PipelineGraph,
        RetryPolicy, StepSpec,
    };
    pub use crate::store::{HistoryFilter, LogEntry, LogFilter, LogFollower, RunStore};
}
