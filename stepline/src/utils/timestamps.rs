//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as an ISO 8601 formatted string with
/// microsecond precision: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Converts the distance from now to `target` into a std duration, clamped
/// at zero for targets in the past.
#[must_use]
pub fn until(target: Timestamp) -> std::time::Duration {
    (target - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}
