//! Identifier generation.
//!
//! Run and schedule ids are time-derived so that lexical order follows
//! creation order. The UUIDv7 suffix keeps two ids minted in the same
//! millisecond distinct.

use chrono::Utc;
use uuid::Uuid;

/// Generates a unique, time-derived run id for a pipeline.
///
/// Format: `<pipeline>_<YYYYmmddTHHMMSS>_<12 hex>`.
#[must_use]
pub fn generate_run_id(pipeline: &str) -> String {
    format!("{pipeline}_{}_{}", Utc::now().format("%Y%m%dT%H%M%S"), short_v7())
}

/// Generates a unique, time-derived schedule id for a pipeline.
#[must_use]
pub fn generate_schedule_id(pipeline: &str) -> String {
    format!("sched_{pipeline}_{}", short_v7())
}

/// The persisted id of a step record within a run.
#[must_use]
pub fn step_record_id(run_id: &str, step_name: &str) -> String {
    format!("{run_id}:{step_name}")
}

fn short_v7() -> String {
    let simple = Uuid::now_v7().simple().to_string();
    // Skip the 48-bit millisecond prefix so the suffix is the random part.
    simple[simple.len() - 12..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_run_ids_are_unique() {
        let ids: HashSet<String> = (0..500).map(|_| generate_run_id("deploy")).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_run_id_prefix() {
        let id = generate_run_id("deploy");
        assert!(id.starts_with("deploy_"));
    }

    #[test]
    fn test_step_record_id() {
        assert_eq!(step_record_id("run1", "build"), "run1:build");
    }
}
