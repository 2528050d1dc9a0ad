use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job is missing a required field or carries an invalid one.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The cron expression could not be parsed.
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    /// A handler was rejected at registration time.
    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    /// No handler is registered under the job's handler name.
    #[error("Handler not found: {name}")]
    HandlerNotFound { name: String },

    /// The durable mirror rejected or failed an operation.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job is already executing. Logged as a skip, never returned from a tick.
    #[error("Job already executing: {id}")]
    DuplicateExecution { id: String },
}

impl SchedulerError {
    /// Short error code string for structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidCronExpression { .. } => "INVALID_CRON_EXPRESSION",
            SchedulerError::InvalidHandler(_) => "INVALID_HANDLER",
            SchedulerError::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            SchedulerError::Persistence(_) => "PERSISTENCE_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::DuplicateExecution { .. } => "DUPLICATE_EXECUTION",
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
