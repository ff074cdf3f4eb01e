//! Pipeline definitions and the dependency graph builder.
//!
//! This module provides:
//! - [`PipelineDefinition`] and [`StepSpec`], deserializable from JSON
//! - [`RetryPolicy`] with backoff and jitter strategies
//! - [`PipelineGraph`], the validated DAG with a deterministic order
//! - [`PipelineCatalog`], the registry a controller looks pipelines up in

mod catalog;
mod dag;
mod retry;
mod spec;

pub use catalog::PipelineCatalog;
pub use dag::PipelineGraph;
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use spec::{ArgValue, PipelineDefinition, StepSpec};
