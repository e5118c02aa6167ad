//! API-facing request/response models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    BufferSnapshot, Engine, EngineError, ExecutionRequest, ExecutionStatus, JobStatus, Spawn,
};
use crate::util::{ExecutionId, JobId};

/// Execution submission payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSubmission {
    /// Target job.
    pub job_id: JobId,
    /// Dispatch options and payload.
    #[serde(flatten)]
    pub request: ExecutionRequest,
}

/// Execution status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    /// Owning job.
    pub job_id: JobId,
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Current status.
    pub status: ExecutionStatus,
    /// Attempt counter.
    pub attempt: u32,
    /// Failure message, if the run failed.
    pub reason: Option<String>,
    /// False when an identical queued execution was returned instead of a
    /// new one.
    pub created: bool,
}

/// Job listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub job_id: JobId,
    /// Job name.
    pub name: String,
    /// Stored status.
    pub status: JobStatus,
    /// Cron expression.
    pub schedule: Option<String>,
    /// Desired concurrency.
    pub threads: usize,
    /// Buffer view; absent while the job is not dispatched.
    pub buffer: Option<BufferSnapshot>,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Engine loops are running.
    pub running: bool,
    /// Jobs currently dispatched.
    pub active_jobs: usize,
}

/// Submit an execution.
///
/// # Errors
///
/// See [`Engine::submit`].
pub async fn submit_execution<S>(
    engine: &Engine<S>,
    req: ExecutionSubmission,
) -> Result<ExecutionStatusResponse, EngineError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let outcome = engine.submit(req.job_id, req.request).await?;
    let execution = outcome.execution;
    Ok(ExecutionStatusResponse {
        job_id: execution.job_id,
        execution_id: execution.id,
        status: execution.status,
        attempt: execution.fail_retry,
        reason: execution.fail_message,
        created: outcome.created,
    })
}

/// Current status of one execution.
///
/// # Errors
///
/// See [`Engine::execution`].
pub async fn execution_status<S>(
    engine: &Engine<S>,
    job_id: JobId,
    execution_id: ExecutionId,
) -> Result<ExecutionStatusResponse, EngineError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let execution = engine.execution(job_id, execution_id).await?;
    Ok(ExecutionStatusResponse {
        job_id,
        execution_id,
        status: execution.status,
        attempt: execution.fail_retry,
        reason: execution.fail_message,
        created: true,
    })
}

/// List every stored job with its buffer view.
///
/// # Errors
///
/// Store failures.
pub async fn list_jobs<S>(engine: &Engine<S>) -> Result<Vec<JobSnapshot>, EngineError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let jobs = engine.store().get_jobs().await?;
    Ok(jobs
        .into_iter()
        .map(|job| JobSnapshot {
            job_id: job.id,
            buffer: engine.job_snapshot(job.id),
            name: job.name,
            status: job.status,
            schedule: job.schedule,
            threads: job.threads,
        })
        .collect())
}

/// Return a health payload.
pub fn health<S>(engine: &Engine<S>) -> Health
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let active_jobs = engine
        .buffer()
        .job_ids()
        .into_iter()
        .filter(|id| engine.is_active(*id))
        .count();
    Health {
        ok: true,
        running: engine.is_running(),
        active_jobs,
    }
}

/// Parse a JSON submission body.
///
/// # Errors
///
/// The serde error text.
pub fn parse_submission(body: &str) -> Result<ExecutionSubmission, String> {
    serde_json::from_str(body).map_err(|e| format!("parse error: {e}"))
}

/// Render any API model as JSON.
#[must_use]
pub fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
