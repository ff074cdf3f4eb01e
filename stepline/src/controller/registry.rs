//! Registry of runs executing in this process.

use crate::cancellation::CancellationToken;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
struct ActiveRun {
    pipeline: String,
    cancel: Arc<CancellationToken>,
}

/// Tracks live runs by id so they can be cancelled.
///
/// Owned by the run controller; nothing else holds a reference.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<String, ActiveRun>,
}

impl RunRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run and returns its cancellation flag.
    pub(crate) fn register(&self, run_id: &str, pipeline: &str) -> Arc<CancellationToken> {
        let cancel = Arc::new(CancellationToken::new());
        self.runs.insert(
            run_id.to_string(),
            ActiveRun {
                pipeline: pipeline.to_string(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Forgets a finished run.
    pub(crate) fn deregister(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    /// Requests cancellation of the run with id `key`, or of every live run
    /// of the pipeline named `key`. Returns true if anything was cancelled.
    pub fn cancel(&self, key: &str, reason: &str) -> bool {
        let mut cancelled = false;
        for entry in self.runs.iter() {
            if entry.key() == key || entry.value().pipeline == key {
                if entry.value().cancel.cancel(reason) {
                    info!(run_id = %entry.key(), pipeline = %entry.value().pipeline, reason = %reason, "Cancellation requested");
                }
                cancelled = true;
            }
        }
        cancelled
    }

    /// Returns true while the run is executing.
    #[must_use]
    pub fn is_running(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Ids of live runs, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_by_run_id() {
        let registry = RunRegistry::new();
        let token = registry.register("r1", "deploy");
        let other = registry.register("r2", "deploy");

        assert!(registry.cancel("r1", "stop"));
        assert!(token.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_cancel_by_pipeline_name() {
        let registry = RunRegistry::new();
        let a = registry.register("r1", "deploy");
        let b = registry.register("r2", "deploy");
        let c = registry.register("r3", "report");

        assert!(registry.cancel("deploy", "stop"));
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(!c.is_cancelled());
    }

    #[test]
    fn test_unknown_key_is_false() {
        let registry = RunRegistry::new();
        registry.register("r1", "deploy");
        assert!(!registry.cancel("nope", "stop"));
    }

    #[test]
    fn test_deregister() {
        let registry = RunRegistry::new();
        registry.register("r1", "deploy");
        assert!(registry.is_running("r1"));
        assert_eq!(registry.running(), vec!["r1".to_string()]);

        registry.deregister("r1");
        assert!(!registry.is_running("r1"));
        assert!(!registry.cancel("r1", "stop"));
    }
}
