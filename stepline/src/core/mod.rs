//! Core run-state types.
//!
//! This module provides:
//! - Status enums for runs, steps, logs and schedules
//! - [`PipelineRun`] and the [`StepRecord`]s it owns
//! - [`RunReport`], the result of executing a pipeline
//! - [`ScheduleRecord`], a persisted trigger

mod run;
mod schedule;
mod status;

pub use run::{tail, PipelineRun, RunReport, StepRecord, STDERR_TAIL_BYTES};
pub use schedule::{ScheduleRecord, ScheduleSpec};
pub use status::{
    ExecutionMode, LogType, ParseStatusError, RunStatus, ScheduleStatus, StepStatus,
};
