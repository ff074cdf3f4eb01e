//! Trigger rules: when a schedule fires next.

use crate::core::ScheduleSpec;
use crate::errors::ConfigError;
use crate::utils::Timestamp;
use chrono::Duration as ChronoDuration;
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

/// Day names indexed by crontab weekday number (Sunday is 0).
const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed, ready-to-evaluate trigger.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Cron schedule, evaluated in UTC.
    Cron {
        /// The expression as written by the caller.
        expression: String,
        /// Parsed schedule.
        schedule: Box<Schedule>,
    },
    /// Fixed interval.
    Interval(Duration),
}

impl Trigger {
    /// Parses a cron expression.
    ///
    /// Five-field crontab expressions get a leading `0` seconds field and
    /// their numeric weekdays (0-7, Sunday is 0 or 7) are rewritten as day
    /// names; six-field expressions are used as-is.
    pub fn cron(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, day, month, weekday] => {
                let weekday = crontab_weekdays(weekday).map_err(invalid)?;
                format!("0 {minute} {hour} {day} {month} {weekday}")
            }
            [_, _, _, _, _, _] => fields.join(" "),
            other => {
                return Err(invalid(format!(
                    "expected 5 or 6 fields, found {}",
                    other.len()
                )))
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// A fixed interval. Zero is rejected.
    pub fn interval(every: Duration) -> Result<Self, ConfigError> {
        if every.is_zero() {
            return Err(ConfigError::InvalidSchedule {
                expression: format!("{}s", every.as_secs_f64()),
                reason: "interval must be positive".to_string(),
            });
        }
        Ok(Self::Interval(every))
    }

    /// Parses a stored or requested schedule spec.
    pub fn from_spec(spec: &ScheduleSpec) -> Result<Self, ConfigError> {
        match spec {
            ScheduleSpec::Cron(expression) => Self::cron(expression),
            ScheduleSpec::Interval(every) => Self::interval(*every),
        }
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
            Self::Interval(every) => ChronoDuration::from_std(*every)
                .ok()
                .and_then(|step| after.checked_add_signed(step)),
        }
    }

    /// First fire time after `now` on the cadence anchored at `anchor`.
    ///
    /// Fires missed while the process was down are not replayed. Interval
    /// triggers keep their phase relative to `anchor`; cron triggers have
    /// no phase.
    #[must_use]
    pub fn next_fire(&self, anchor: Timestamp, now: Timestamp) -> Option<Timestamp> {
        let Self::Interval(every) = self else {
            return self.next_after(now);
        };
        let candidate = self.next_after(anchor)?;
        if candidate > now {
            return Some(candidate);
        }
        let elapsed = (now - anchor).to_std().ok()?;
        let periods = elapsed.as_nanos() / every.as_nanos().max(1) + 1;
        let offset = every.checked_mul(u32::try_from(periods).ok()?)?;
        anchor.checked_add_signed(ChronoDuration::from_std(offset).ok()?)
    }

}

/// Rewrites a crontab day-of-week field into day names.
///
/// Numeric items (single days, ranges, `*` and steps over either) are
/// expanded; items that already use names are kept.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid weekday step in '{item}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        let (low, high) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((low, high)) => (weekday_number(low)?, weekday_number(high)?),
                None => {
                    let day = weekday_number(range)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if low > high {
            return Err(format!("weekday range '{range}' runs backwards"));
        }
        days.extend((low..=high).step_by(step.unwrap_or(1)).map(|d| d % 7));
    }

    let mut items: Vec<String> = days.into_iter().map(|d| WEEKDAYS[d].to_string()).collect();
    items.extend(named);
    Ok(items.join(","))
}

fn weekday_number(text: &str) -> Result<usize, String> {
    text.parse::<usize>()
        .ok()
        .filter(|d| *d <= 7)
        .ok_or_else(|| format!("invalid weekday '{text}'"))
}
