use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::now_ms;
use crate::error::{Result, SchedulerError};
use crate::schedule;

/// Epoch milliseconds.
pub type Millis = i64;

/// Lifecycle state of a job within one execution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its schedule time.
    Pending,
    /// Handler is currently executing.
    Running,
    /// Last execution returned normally.
    Completed,
    /// Last execution returned an error.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Retry policy descriptor attached to a job.
///
/// Kept verbatim as JSON so that records written by other producers survive a
/// load/store cycle untouched. Stored and recovered with the job but not
/// consulted by the scheduler: failed one-shot jobs are retained for manual
/// retry regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryStrategy(Value);

impl RetryStrategy {
    pub fn new(descriptor: Value) -> Self {
        Self(descriptor)
    }

    pub fn descriptor(&self) -> &Value {
        &self.0
    }

    /// `max_attempts` (or `maxAttempts`) when present and numeric.
    pub fn max_attempts(&self) -> Option<u32> {
        self.field(&["max_attempts", "maxAttempts"])
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// `backoff_ms` (or `backoffMs`) when present and numeric.
    pub fn backoff_ms(&self) -> Option<u64> {
        self.field(&["backoff_ms", "backoffMs"]).and_then(Value::as_u64)
    }

    fn field(&self, names: &[&str]) -> Option<&Value> {
        names.iter().find_map(|name| self.0.get(*name))
    }
}

/// How a recurring job picks its next schedule time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Six-field cron expression (seconds first).
    Cron(String),
    /// Fixed delay in milliseconds after each cycle.
    Interval(u64),
}

/// One schedulable unit of work. Pure data: the handler is referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique ID, immutable after creation.
    pub id: String,
    /// Instant at which the job becomes eligible to run.
    pub schedule_time: Millis,
    /// Key into the handler registry.
    pub handler_name: String,
    /// Payload handed to the handler; opaque to the scheduler.
    pub data: Value,
    pub status: JobStatus,
    pub created_at: Millis,
    /// Completion instant of the most recent attempt.
    pub executed_at: Option<Millis>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Number of failed attempts since the last reset.
    pub retry_count: u32,
    pub recurring: bool,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<u64>,
    pub retry_strategy: Option<RetryStrategy>,
}

impl Job {
    /// Build a pending one-shot job created now.
    pub fn new(
        id: impl Into<String>,
        schedule_time: Millis,
        handler_name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            schedule_time,
            handler_name: handler_name.into(),
            data,
            status: JobStatus::Pending,
            created_at: now_ms(),
            executed_at: None,
            last_error: None,
            retry_count: 0,
            recurring: false,
            cron_expression: None,
            interval_ms: None,
            retry_strategy: None,
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.recurring = true;
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.recurring = true;
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_created_at(mut self, created_at: Millis) -> Self {
        self.created_at = created_at;
        self
    }

    /// The active recurrence mode. Cron wins when both are set.
    pub fn recurrence(&self) -> Option<Recurrence> {
        if !self.recurring {
            return None;
        }
        if let Some(expr) = self.cron_expression.as_deref().filter(|e| !e.is_empty()) {
            return Some(Recurrence::Cron(expr.to_string()));
        }
        match self.interval_ms {
            Some(ms) if ms > 0 => Some(Recurrence::Interval(ms)),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence().is_some()
    }

    /// Pending and past its schedule time.
    pub fn is_due(&self, now: Millis) -> bool {
        self.status == JobStatus::Pending && self.schedule_time <= now
    }

    /// Clear per-cycle execution state before the next occurrence.
    pub fn reset_for_next_run(&mut self) {
        self.status = JobStatus::Pending;
        self.executed_at = None;
        self.last_error = None;
        self.retry_count = 0;
    }

    pub fn schedule_description(&self) -> String {
        match self.recurrence() {
            Some(Recurrence::Cron(expr)) => format!("Recurring: {expr}"),
            Some(Recurrence::Interval(ms)) => format!("Recurring: every {ms}ms"),
            None => match chrono::DateTime::from_timestamp_millis(self.schedule_time) {
                Some(at) => format!("One-time: {}", at.to_rfc3339()),
                None => format!("Schedule: {}", self.schedule_time),
            },
        }
    }

    /// Check required fields and the recurrence settings.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::Validation("job id must not be empty".into()));
        }
        if self.handler_name.trim().is_empty() {
            return Err(SchedulerError::Validation(format!(
                "job {} has no handler name",
                self.id
            )));
        }
        if !self.recurring {
            return Ok(());
        }
        match self.recurrence() {
            Some(Recurrence::Cron(expr)) => schedule::parse(&expr).map(|_| ()),
            Some(Recurrence::Interval(_)) => Ok(()),
            None => Err(SchedulerError::Validation(format!(
                "recurring job {} needs a cron expression or a positive interval",
                self.id
            ))),
        }
    }

    /// Flatten into the mirror's scalar-only representation.
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            schedule_time: self.schedule_time,
            handler_name: self.handler_name.clone(),
            data: self.data.to_string(),
            status: self.status.to_string(),
            created_at: self.created_at,
            retry_strategy: self.retry_strategy.as_ref().map(|s| s.0.to_string()),
            recurring: self.recurring,
            cron_expression: self.cron_expression.clone(),
            interval_ms: self.interval_ms.map(|ms| ms as i64),
            executed_at: self.executed_at,
            last_error: self.last_error.clone(),
            retry_count: self.retry_count,
        }
    }

    /// Rebuild a job from a mirror record.
    ///
    /// Malformed `data` decodes to `{}` and malformed `retry_strategy` to
    /// `None`. A missing id, handler name or an unknown status is an error:
    /// the record cannot be scheduled safely.
    pub fn from_record(record: JobRecord) -> Result<Self> {
        if record.id.trim().is_empty() {
            return Err(SchedulerError::Validation("record has no id".into()));
        }
        if record.handler_name.trim().is_empty() {
            return Err(SchedulerError::Validation(format!(
                "record {} has no handler name",
                record.id
            )));
        }
        let status = record
            .status
            .parse::<JobStatus>()
            .map_err(|e: String| SchedulerError::Validation(format!("record {}: {e}", record.id)))?;

        let data = match serde_json::from_str::<Value>(&record.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %record.id, "malformed data payload, using {{}}: {e}");
                Value::Object(Default::default())
            }
        };
        let retry_strategy = record.retry_strategy.as_deref().and_then(|raw| {
            serde_json::from_str::<Value>(raw)
                .map(RetryStrategy)
                .map_err(|e| warn!(job_id = %record.id, "malformed retry strategy ignored: {e}"))
                .ok()
        });

        Ok(Self {
            id: record.id,
            schedule_time: record.schedule_time,
            handler_name: record.handler_name,
            data,
            status,
            created_at: record.created_at,
            executed_at: record.executed_at,
            last_error: record.last_error.filter(|e| !e.is_empty()),
            retry_count: record.retry_count,
            recurring: record.recurring,
            cron_expression: record.cron_expression.filter(|e| !e.is_empty()),
            interval_ms: record.interval_ms.and_then(|ms| u64::try_from(ms).ok()),
            retry_strategy,
        })
    }
}

/// Flat, scalar-only row stored by a [`crate::mirror::JobMirror`].
///
/// `data` and `retry_strategy` hold JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub schedule_time: Millis,
    pub handler_name: String,
    pub data: String,
    pub status: String,
    pub created_at: Millis,
    pub retry_strategy: Option<String>,
    pub recurring: bool,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<i64>,
    pub executed_at: Option<Millis>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Partial update applied by [`crate::mirror::JobMirror::update_fields`].
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdate {
    pub status: Option<JobStatus>,
    pub executed_at: Option<Option<Millis>>,
    pub last_error: Option<Option<String>>,
    pub retry_count: Option<u32>,
}

impl FieldUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
