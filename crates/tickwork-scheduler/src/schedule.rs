//! Cron evaluation and next-run computation.
//!
//! Expressions use the six-field form with seconds first
//! (`sec min hour day-of-month month day-of-week`), optionally followed by a
//! year. Nothing is cached: every call re-parses, which is cheap at tick
//! granularity.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{Millis, Recurrence};

/// Parse `expr` into a cron schedule.
pub fn parse(expr: &str) -> Result<cron::Schedule> {
    if expr.trim().is_empty() {
        return Err(invalid(expr, "expression is empty"));
    }
    cron::Schedule::from_str(expr.trim()).map_err(|e| invalid(expr, e.to_string()))
}

/// True when `expr` parses as a cron expression.
pub fn validate(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// First occurrence strictly after `from`.
pub fn next_occurrence(expr: &str, from: Millis) -> Result<Millis> {
    let schedule = parse(expr)?;
    let start = to_datetime(expr, from)?;
    schedule
        .after(&start)
        .next()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| invalid(expr, "no occurrence after the given instant"))
}

/// The next `count` occurrences strictly after `from`, in ascending order.
pub fn next_occurrences(expr: &str, count: usize, from: Millis) -> Result<Vec<Millis>> {
    if count == 0 {
        return Err(SchedulerError::Validation(
            "occurrence count must be positive".into(),
        ));
    }
    let schedule = parse(expr)?;
    let start = to_datetime(expr, from)?;
    let times: Vec<Millis> = schedule
        .after(&start)
        .take(count)
        .map(|dt| dt.timestamp_millis())
        .collect();
    if times.len() < count {
        return Err(invalid(
            expr,
            format!("only {} of {count} occurrences exist", times.len()),
        ));
    }
    Ok(times)
}

/// Human-readable summary of the next two occurrences, or why the
/// expression is invalid.
pub fn describe(expr: &str) -> String {
    match next_occurrences(expr, 2, Utc::now().timestamp_millis()) {
        Ok(times) => format!("Next: {}, then: {}", rfc3339(times[0]), rfc3339(times[1])),
        Err(e) => format!("Invalid cron expression: {e}"),
    }
}

/// Compute the next schedule time for a recurring job, strictly after `from`.
pub fn next_run(recurrence: &Recurrence, from: Millis) -> Result<Millis> {
    match recurrence {
        Recurrence::Cron(expr) => next_occurrence(expr, from),
        Recurrence::Interval(every_ms) => {
            let step = i64::try_from(*every_ms).map_err(|_| {
                SchedulerError::Validation(format!("interval {every_ms}ms is too large"))
            })?;
            Ok(from.saturating_add(step))
        }
    }
}

fn to_datetime(expr: &str, at: Millis) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(at)
        .ok_or_else(|| invalid(expr, format!("instant {at} is out of range")))
}

fn rfc3339(at: Millis) -> String {
    DateTime::from_timestamp_millis(at)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| at.to_string())
}

fn invalid(expr: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCronExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}
