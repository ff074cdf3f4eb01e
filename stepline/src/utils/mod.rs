//! Utility functions for identifiers, timestamps and name validation.

mod ids;
pub mod timestamps;
mod validation;

pub use ids::{generate_run_id, generate_schedule_id, step_record_id};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
pub use validation::validate_name;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
