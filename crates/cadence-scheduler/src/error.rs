use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// A job whose process exits non-zero is not an error: it is reported as a
/// failed [`RunResult`](crate::types::RunResult).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job or trigger definition is malformed or contradictory.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No job with the given ID exists in the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No run record with the given sequence ID exists.
    #[error("Run not found: {id}")]
    RunNotFound { id: i64 },

    /// The registry or history store could not commit.
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// A stored column could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    /// Short error code string sent to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::RunNotFound { .. } => "RUN_NOT_FOUND",
            SchedulerError::Persistence(_) => "PERSISTENCE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
