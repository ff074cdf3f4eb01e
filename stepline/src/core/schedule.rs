//! Persisted schedule records.

use super::ScheduleStatus;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The trigger rule of a schedule, as the caller wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// A five- or six-field cron expression, evaluated in UTC.
    Cron(String),
    /// A fixed interval.
    Interval(Duration),
}

impl ScheduleSpec {
    /// Creates a cron schedule.
    #[must_use]
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron(expression.into())
    }

    /// Creates an interval schedule.
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self::Interval(interval)
    }

    /// The persisted trigger kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::Interval(_) => "interval",
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(expr) => write!(f, "cron '{expr}'"),
            Self::Interval(every) => write!(f, "every {}s", every.as_secs_f64()),
        }
    }
}

/// A schedule as stored in the run store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Schedule id.
    pub id: String,
    /// Pipeline to run when the trigger fires.
    pub pipeline_name: String,
    /// Trigger rule.
    pub spec: ScheduleSpec,
    /// Active or soft-deleted.
    pub status: ScheduleStatus,
    /// When the schedule was created.
    pub created_at: Timestamp,
    /// When the trigger last fired.
    pub last_run: Option<Timestamp>,
    /// When the trigger fires next.
    pub next_run: Option<Timestamp>,
}

impl ScheduleRecord {
    /// Returns true while the schedule is armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }
}
