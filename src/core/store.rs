//! Durable storage seam for jobs and executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::core::error::StoreError;
use crate::core::model::{Execution, ExecutionStatus, Job};
use crate::util::{BatchId, ChainId, ExecutionId, JobId};

/// Result type of store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence backend consumed by the distributor, the worker loops, the
/// cron trigger and the housekeeper.
///
/// Implementations provide their own concurrency safety. No atomic
/// claim-and-update is assumed; the execution buffer guards against double
/// dispatch within one process.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// All registered jobs.
    async fn get_jobs(&self) -> StoreResult<Vec<Job>>;

    /// One job.
    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>>;

    /// Register a job and return its assigned id.
    async fn persist_job(&self, job: Job) -> StoreResult<JobId>;

    /// Replace a stored job.
    async fn update_job(&self, job: &Job) -> StoreResult<()>;

    /// Mature, QUEUED, non-chain-continuation executions of the job, priority
    /// first, then oldest first, at most `limit`.
    async fn get_queued_executions(&self, job_id: JobId, limit: usize)
        -> StoreResult<Vec<Execution>>;

    /// One execution.
    async fn get_by_id(&self, job_id: JobId, id: ExecutionId) -> StoreResult<Option<Execution>>;

    /// Replace a stored execution.
    async fn update(&self, job_id: JobId, id: ExecutionId, execution: &Execution)
        -> StoreResult<()>;

    /// Replace a stored execution only while its stored status is
    /// `expected`. Returns false, leaving the record untouched, when the
    /// status has moved on (an abort or a zombie sweep won the race).
    async fn transition(
        &self,
        job_id: JobId,
        id: ExecutionId,
        expected: ExecutionStatus,
        execution: &Execution,
    ) -> StoreResult<bool>;

    /// Store a new execution and return its assigned id.
    async fn persist(&self, execution: Execution) -> StoreResult<ExecutionId>;

    /// Store a group of executions in one write and return their ids in
    /// input order.
    async fn persist_batch(&self, executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>>;

    /// Store the links of a chain in one write. Ids are assigned in order
    /// and each link's predecessor/successor ids are wired before any link
    /// becomes visible.
    async fn persist_chain(&self, executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>>;

    /// Remove an execution.
    async fn delete(&self, job_id: JobId, id: ExecutionId) -> StoreResult<()>;

    /// QUEUED chain member whose predecessor is `previous_execution_id`.
    async fn get_next_in_chain(
        &self,
        job_id: JobId,
        chain_id: ChainId,
        previous_execution_id: ExecutionId,
    ) -> StoreResult<Option<Execution>>;

    /// True when no member of the batch is QUEUED.
    async fn is_batch_finished(&self, job_id: JobId, batch_id: BatchId) -> StoreResult<bool>;

    /// Move every QUEUED member of the chain to ABORTED; returns how many.
    async fn abort_chain(&self, job_id: JobId, chain_id: ChainId) -> StoreResult<usize>;

    /// RUNNING executions started before `older_than`.
    async fn find_expired_executions(&self, older_than: DateTime<Utc>)
        -> StoreResult<Vec<Execution>>;

    /// A QUEUED execution of the job with the given parameter hash.
    async fn find_queued_by_hash(&self, job_id: JobId, hash: &str)
        -> StoreResult<Option<Execution>>;

    /// Delete terminal executions of the job created before `before`;
    /// returns how many.
    async fn delete_terminal_before(&self, job_id: JobId, before: DateTime<Utc>)
        -> StoreResult<usize>;

    /// Push channel of newly persisted QUEUED executions, if the backend can
    /// notify. Without it the distributor relies on polling alone.
    fn subscribe(&self) -> Option<broadcast::Receiver<Execution>> {
        None
    }
}
