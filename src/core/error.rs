//! Error types for engine operations.

use thiserror::Error;

use crate::util::{ExecutionId, JobId};

/// Errors reported by execution store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors produced by engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No job with the given id is known to the store.
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// No execution with the given id exists for the job.
    #[error("execution {execution_id} of job {job_id} not found")]
    ExecutionNotFound {
        /// Owning job.
        job_id: JobId,
        /// Missing execution.
        execution_id: ExecutionId,
    },
    /// The job's worker reference has no binding in the work registry.
    #[error("no worker registered for `{0}`")]
    NoWorker(String),
    /// The job's cron expression could not be parsed.
    #[error("invalid schedule `{expression}`: {reason}")]
    InvalidSchedule {
        /// Offending expression.
        expression: String,
        /// Parser message.
        reason: String,
    },
    /// Operation targeted a job whose buffer state was never created.
    #[error("no buffer state for job {0}")]
    BufferMissing(JobId),
    /// Operation requires the job to be active.
    #[error("job {0} is not active")]
    JobInactive(JobId),
    /// A batch or chain was submitted without members.
    #[error("cannot submit an empty {0}")]
    EmptyGroup(&'static str),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Async runtime unavailable or misused.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
