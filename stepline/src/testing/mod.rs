//! Testing utilities for stepline pipelines.
//!
//! This module provides:
//! - [`ScriptedTaskRunner`], a task runner returning scripted outcomes
//! - Invocation records with start/end instants for ordering assertions

mod mocks;

pub use mocks::{Invocation, ScriptedOutcome, ScriptedTaskRunner};
