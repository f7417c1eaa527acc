use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column (payload or repeat options) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller input rejected before anything was written (e.g. empty job name).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The interval is neither a cron expression nor a parseable duration.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// The repeat timezone is not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Persisting a single named job failed.
    #[error("Failed to save job '{name}': {source}")]
    Persistence {
        name: String,
        #[source]
        source: Box<SchedulerError>,
    },

    /// At least one job of a multi-name `every` call failed. Which ones is
    /// intentionally not reported; jobs that did persist are left in place.
    #[error("Error creating one or more of the jobs")]
    Scheduling,

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Short error code string for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidInterval(_) => "INVALID_INTERVAL",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::Persistence { .. } => "PERSISTENCE_ERROR",
            SchedulerError::Scheduling => "SCHEDULING_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for errors raised while checking caller input, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::InvalidInterval(_)
                | SchedulerError::InvalidTimezone(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
