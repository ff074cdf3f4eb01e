//! Step execution.
//!
//! This module provides:
//! - The [`TaskRunner`] boundary and its streaming [`OutputSink`]
//! - [`CommandTaskRunner`], which runs tasks as child processes
//! - [`StepExecutor`], which wraps a runner with conditions, retries and
//!   timeouts

mod command;
mod runner;
mod step;

pub use command::CommandTaskRunner;
pub use runner::{NullOutputSink, OutputSink, TaskOutput, TaskRequest, TaskRunner};
pub use step::{
    StepExecutor, StepScope, CANCELLED_EXIT_CODE, CONDITION_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
