//! Scripted task runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::LogType;
use crate::errors::TaskError;
use crate::executor::{OutputSink, TaskOutput, TaskRequest, TaskRunner};
use crate::pipeline::ArgValue;

/// What one scripted invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
    delay: Duration,
    jitter: Duration,
}

impl Default for ScriptedOutcome {
    fn default() -> Self {
        Self::success("")
    }
}

impl ScriptedOutcome {
    /// Exits 0 after printing `stdout`.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: as_lines(stdout.into()),
            stderr: String::new(),
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Exits with `code` after printing `stderr`.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: code,
            stdout: String::new(),
            stderr: as_lines(stderr.into()),
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Sleeps before producing output.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Adds a random extra sleep of up to `max`.
    #[must_use]
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter = max;
        self
    }

    /// Also prints `stderr`.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = as_lines(stderr.into());
        self
    }

    fn sleep_for(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis());
        self.delay + Duration::from_millis(u64::try_from(extra).unwrap_or(0))
    }
}

fn as_lines(text: String) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text
    } else {
        text + "\n"
    }
}

/// One recorded call to the runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Step name.
    pub step: String,
    /// Task reference.
    pub task: String,
    /// Attempt number.
    pub attempt: u32,
    /// Arguments passed.
    pub args: BTreeMap<String, ArgValue>,
    /// When the runner was entered.
    pub started: Instant,
    /// When the invocation returned or was dropped.
    pub finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    sequences: HashMap<String, VecDeque<ScriptedOutcome>>,
    outcomes: HashMap<String, ScriptedOutcome>,
    invocations: Vec<Invocation>,
    active: usize,
    peak: usize,
}

impl State {
    fn next_outcome(&mut self, task: &str) -> ScriptedOutcome {
        if let Some(outcome) = self.sequences.get_mut(task).and_then(VecDeque::pop_front) {
            return outcome;
        }
        self.outcomes.get(task).cloned().unwrap_or_default()
    }
}

/// A [`TaskRunner`] returning scripted outcomes per task reference.
///
/// Unscripted tasks succeed immediately with no output. Clones share state,
/// so a test can keep a handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTaskRunner {
    state: Arc<Mutex<State>>,
}

impl ScriptedTaskRunner {
    /// Creates a runner where every task succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation of `task` produces `outcome`.
    #[must_use]
    pub fn with_outcome(self, task: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.state.lock().outcomes.insert(task.into(), outcome);
        self
    }

    /// Invocations of `task` consume `outcomes` in order, then fall back to
    /// the task's outcome.
    #[must_use]
    pub fn with_sequence(self, task: impl Into<String>, outcomes: Vec<ScriptedOutcome>) -> Self {
        self.state
            .lock()
            .sequences
            .insert(task.into(), outcomes.into_iter().collect());
        self
    }

    /// All invocations in the order they started.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// First invocation of `step`.
    #[must_use]
    pub fn invocation(&self, step: &str) -> Option<Invocation> {
        self.state
            .lock()
            .invocations
            .iter()
            .find(|i| i.step == step)
            .cloned()
    }

    /// Step names in the order they started.
    #[must_use]
    pub fn invoked_steps(&self) -> Vec<String> {
        self.state
            .lock()
            .invocations
            .iter()
            .map(|i| i.step.clone())
            .collect()
    }

    /// Number of invocations of `task`.
    #[must_use]
    pub fn invocation_count(&self, task: &str) -> usize {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|i| i.task == task)
            .count()
    }

    /// Number of invocations of any task.
    #[must_use]
    pub fn total_invocations(&self) -> usize {
        self.state.lock().invocations.len()
    }

    /// Highest number of invocations in progress at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak
    }
}

/// Stamps the end of an invocation, even when its future is dropped.
struct ActiveGuard {
    state: Arc<Mutex<State>>,
    index: usize,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if let Some(invocation) = state.invocations.get_mut(self.index) {
            invocation.finished = Some(Instant::now());
        }
    }
}

#[async_trait]
impl TaskRunner for ScriptedTaskRunner {
    async fn run(
        &self,
        request: &TaskRequest,
        output: &dyn OutputSink,
    ) -> Result<TaskOutput, TaskError> {
        let (outcome, index) = {
            let mut state = self.state.lock();
            let outcome = state.next_outcome(&request.task);
            state.invocations.push(Invocation {
                step: request.step.clone(),
                task: request.task.clone(),
                attempt: request.attempt,
                args: request.args.clone(),
                started: Instant::now(),
                finished: None,
            });
            state.active += 1;
            state.peak = state.peak.max(state.active);
            (outcome, state.invocations.len() - 1)
        };
        let _guard = ActiveGuard {
            state: self.state.clone(),
            index,
        };

        let pause = outcome.sleep_for();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        for line in outcome.stdout.lines() {
            output.line(LogType::Stdout, line).await;
        }
        for line in outcome.stderr.lines() {
            output.line(LogType::Stderr, line).await;
        }

        if outcome.exit_code == 0 {
            Ok(TaskOutput {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            })
        } else {
            Err(TaskError::NonZeroExit {
                code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            })
        }
    }
}
