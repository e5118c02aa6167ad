//! Worker loop: one instance per occupied concurrency slot of a job.
//!
//! State machine per slot: `CLAIM -> RUN -> {SUCCEED | FAIL} -> (CLAIM | EXIT)`.
//! Chain successors and retries are run directly by the same slot without
//! going back through the buffer, which keeps chains strictly ordered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::core::buffer::{Claim, ExecutionBuffer, Retirement, WorkerHandle};
use crate::core::distributor::disable_job;
use crate::core::events::{EngineEvent, Notifier};
use crate::core::model::{Execution, ExecutionStatus, Job, JobStatus};
use crate::core::registry::{InvokeError, WorkContext, WorkRegistry};
use crate::core::store::ExecutionStore;
use crate::util::{now, ExecutionId, JobId, WorkerId};

/// Shared context of all worker loops.
pub struct WorkerLoop {
    store: Arc<dyn ExecutionStore>,
    buffer: Arc<ExecutionBuffer>,
    registry: Arc<WorkRegistry>,
    notifier: Notifier,
}

/// How a run ended.
enum RunOutcome {
    Succeeded,
    Failed { message: String, stacktrace: String },
    Unbound(String),
}

impl WorkerLoop {
    /// Build the shared worker context.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        buffer: Arc<ExecutionBuffer>,
        registry: Arc<WorkRegistry>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            buffer,
            registry,
            notifier,
        }
    }

    /// Drive one slot until the buffer runs dry or a stop is requested.
    ///
    /// `handle` must already be registered with the buffer; it is
    /// deregistered before this returns. A stop is only honoured before a
    /// claim: in-flight runs and their direct continuations (retries, chain
    /// successors) always complete, since nothing else would ever pick up a
    /// chain successor.
    pub async fn run(self: Arc<Self>, job: Job, handle: WorkerHandle) {
        let job_id = job.id;
        let worker_id = handle.id;
        debug!(job_id, worker_id, "worker loop started");

        let mut next: Option<Execution> = None;
        loop {
            let execution = match next.take() {
                Some(execution) => execution,
                None => {
                    if handle.stop.is_stopped() {
                        let retirement = self.buffer.deregister_worker(job_id, worker_id);
                        debug!(job_id, worker_id, "worker loop stopped");
                        self.retire(job_id, worker_id, retirement);
                        return;
                    }
                    match self.buffer.claim_for_worker(job_id, worker_id) {
                        Claim::Execution(id) => match self.load_claimed(job_id, id).await {
                            Some(execution) => execution,
                            None => continue,
                        },
                        Claim::Retire(retirement) => {
                            self.retire(job_id, worker_id, retirement);
                            return;
                        }
                    }
                }
            };
            next = self.execute(&job, execution).await;
        }
    }

    fn retire(&self, job_id: JobId, worker_id: WorkerId, retirement: Retirement) {
        debug!(job_id, worker_id, last = retirement.last, "worker loop exiting");
        if retirement.last {
            self.notifier.emit(EngineEvent::JobAllDone {
                job_id,
                elapsed_ms: retirement.elapsed.map(millis),
            });
        }
    }

    /// Fetch a claimed id; anything no longer QUEUED in the store is dropped.
    async fn load_claimed(&self, job_id: JobId, id: ExecutionId) -> Option<Execution> {
        match self.store.get_by_id(job_id, id).await {
            Ok(Some(execution)) if execution.status == ExecutionStatus::Queued => Some(execution),
            Ok(Some(execution)) => {
                debug!(
                    job_id,
                    execution_id = id,
                    status = ?execution.status,
                    "claimed execution is no longer queued"
                );
                self.buffer.unmark_running(job_id, id);
                None
            }
            Ok(None) => {
                warn!(job_id, execution_id = id, "claimed execution vanished from store");
                self.buffer.unmark_running(job_id, id);
                None
            }
            Err(e) => {
                error!(job_id, execution_id = id, error = %e, "failed to load claimed execution");
                self.buffer.unmark_running(job_id, id);
                None
            }
        }
    }

    /// RUN one execution and apply its outcome. Returns the execution this
    /// slot runs next without claiming, if any.
    ///
    /// The RUNNING transition only applies while the stored record is still
    /// QUEUED, so a retry or chain link aborted while this slot held it in
    /// memory is dropped instead of run.
    async fn execute(&self, job: &Job, mut execution: Execution) -> Option<Execution> {
        let job_id = job.id;
        let id = execution.id;

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(now());
        match self
            .store
            .transition(job_id, id, ExecutionStatus::Queued, &execution)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id, execution_id = id, "execution left QUEUED before it started");
                self.buffer.unmark_running(job_id, id);
                return None;
            }
            Err(e) => {
                error!(job_id, execution_id = id, error = %e, "failed to mark execution running");
                self.buffer.unmark_running(job_id, id);
                return None;
            }
        }
        debug!(job_id, execution_id = id, attempt = execution.fail_retry, "execution started");

        let ctx = WorkContext::new(job_id, id, execution.fail_retry);
        let started = Instant::now();
        let outcome = match self
            .registry
            .invoke(&job.worker_ref, execution.parameters.clone(), &ctx)
            .await
        {
            Ok(()) => RunOutcome::Succeeded,
            Err(InvokeError::Failed(err)) => RunOutcome::Failed {
                message: err.to_string(),
                stacktrace: format!("{err:?}"),
            },
            Err(InvokeError::Unbound(worker_ref)) => RunOutcome::Unbound(worker_ref),
        };
        execution.ended_at = Some(now());
        execution.duration_ms = Some(millis(started.elapsed()));
        execution.log = ctx.take_log();

        match outcome {
            RunOutcome::Succeeded => self.succeed(job, execution, started).await,
            RunOutcome::Failed {
                message,
                stacktrace,
            } => self.fail(job, execution, message, stacktrace).await,
            RunOutcome::Unbound(worker_ref) => {
                let message = format!("no worker registered for `{worker_ref}`");
                self.buffer.unmark_running(job_id, id);
                execution.status = ExecutionStatus::Failed;
                execution.fail_message = Some(message.clone());
                self.fail_terminally(&execution, message.clone()).await;
                self.buffer.cancel(job_id);
                let status = JobStatus::NoWorker;
                disable_job(&*self.store, &self.notifier, job_id, status, message).await;
                None
            }
        }
    }

    async fn succeed(
        &self,
        job: &Job,
        mut execution: Execution,
        started: Instant,
    ) -> Option<Execution> {
        let job_id = job.id;
        let id = execution.id;

        execution.status = ExecutionStatus::Finished;
        let recorded = self.record_outcome(&execution).await;
        self.buffer.unmark_running(job_id, id);
        if !recorded {
            return None;
        }
        self.notifier.emit(EngineEvent::ExecutionFinished {
            job_id,
            execution_id: id,
            duration_ms: execution.duration_ms.unwrap_or_default(),
        });

        if let Some(spacing) = job.min_spacing() {
            let spent = started.elapsed();
            if spent < spacing {
                debug!(job_id, wait_ms = millis(spacing - spent), "throttling");
                tokio::time::sleep(spacing - spent).await;
            }
        }

        self.check_batch(&execution).await;

        let chain_id = execution.chain_id?;
        match self
            .store
            .get_next_in_chain(job_id, chain_id, execution.chain_anchor_id())
            .await
        {
            Ok(Some(successor)) => {
                if self.buffer.take_for_run(job_id, successor.id) {
                    debug!(job_id, execution_id = successor.id, %chain_id, "continuing chain");
                    Some(successor)
                } else {
                    warn!(job_id, execution_id = successor.id, "chain successor already running");
                    None
                }
            }
            Ok(None) => {
                self.notifier.emit(EngineEvent::ChainFinished { job_id, chain_id });
                None
            }
            Err(e) => {
                error!(job_id, %chain_id, error = %e, "failed to fetch chain successor");
                None
            }
        }
    }

    async fn fail(
        &self,
        job: &Job,
        mut execution: Execution,
        message: String,
        stacktrace: String,
    ) -> Option<Execution> {
        let job_id = job.id;
        let id = execution.id;
        self.buffer.unmark_running(job_id, id);
        execution.status = ExecutionStatus::Failed;
        execution.fail_message = Some(message.clone());
        execution.fail_stacktrace = Some(stacktrace);

        if execution.fail_retry < job.fail_retries {
            // A retry that cannot be stored leaves this failure terminal.
            if let Some(retry) = self.create_retry(&execution).await {
                // Owned before the failed attempt is recorded so the push
                // path cannot hand the retry to another slot meanwhile.
                let owned = self.buffer.take_for_run(job_id, retry.id);
                if !self.record_outcome(&execution).await {
                    self.withdraw_retry(retry, owned).await;
                    return None;
                }
                info!(
                    job_id,
                    execution_id = id,
                    retry_execution_id = retry.id,
                    attempt = retry.fail_retry,
                    "retry scheduled"
                );
                self.notifier.emit(EngineEvent::RetryScheduled {
                    job_id,
                    execution_id: id,
                    retry_execution_id: retry.id,
                    attempt: retry.fail_retry,
                });
                if !owned {
                    debug!(job_id, execution_id = retry.id, "retry claimed by another slot");
                    return None;
                }
                tokio::time::sleep(job.retry_delay()).await;
                return Some(retry);
            }
        }

        self.fail_terminally(&execution, message).await;
        None
    }

    /// Persist the next attempt of a failed execution.
    async fn create_retry(&self, failed: &Execution) -> Option<Execution> {
        let mut retry = failed.to_retry();
        match self.store.persist(retry.clone()).await {
            Ok(retry_id) => {
                retry.id = retry_id;
                Some(retry)
            }
            Err(e) => {
                error!(
                    job_id = failed.job_id,
                    execution_id = failed.id,
                    error = %e,
                    "failed to persist retry"
                );
                None
            }
        }
    }

    /// Abort a retry whose failed attempt was reclassified meanwhile.
    async fn withdraw_retry(&self, mut retry: Execution, owned: bool) {
        let (job_id, id) = (retry.job_id, retry.id);
        retry.status = ExecutionStatus::Aborted;
        retry.ended_at = Some(now());
        match self
            .store
            .transition(job_id, id, ExecutionStatus::Queued, &retry)
            .await
        {
            Ok(true) => debug!(job_id, execution_id = id, "retry withdrawn"),
            Ok(false) => {
                warn!(job_id, execution_id = id, "retry left QUEUED before it could be withdrawn");
            }
            Err(e) => error!(job_id, execution_id = id, error = %e, "failed to withdraw retry"),
        }
        if owned {
            self.buffer.unmark_running(job_id, id);
        }
    }

    /// Write a run's outcome while the stored record is still RUNNING.
    /// False when something else (a zombie sweep) already ended it; store
    /// errors are logged and count as written.
    async fn record_outcome(&self, execution: &Execution) -> bool {
        let (job_id, id) = (execution.job_id, execution.id);
        match self
            .store
            .transition(job_id, id, ExecutionStatus::Running, execution)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    job_id,
                    execution_id = id,
                    outcome = ?execution.status,
                    "execution already ended elsewhere, outcome dropped"
                );
                false
            }
            Err(e) => {
                error!(
                    job_id,
                    execution_id = id,
                    error = %e,
                    "failed to persist execution outcome"
                );
                true
            }
        }
    }

    /// Record a failure with no retry, abort the rest of its chain, report
    /// and check the batch.
    async fn fail_terminally(&self, execution: &Execution, message: String) {
        let job_id = execution.job_id;
        if !self.record_outcome(execution).await {
            return;
        }
        if let Some(chain_id) = execution.chain_id {
            match self.store.abort_chain(job_id, chain_id).await {
                Ok(aborted) => self.notifier.emit(EngineEvent::ChainAborted {
                    job_id,
                    chain_id,
                    aborted,
                }),
                Err(e) => error!(job_id, %chain_id, error = %e, "failed to abort chain"),
            }
        }
        self.notifier.emit(EngineEvent::ExecutionFailed {
            job_id,
            execution_id: execution.id,
            message,
        });
        self.check_batch(execution).await;
    }

    async fn check_batch(&self, execution: &Execution) {
        let Some(batch_id) = execution.batch_id else {
            return;
        };
        match self.store.is_batch_finished(execution.job_id, batch_id).await {
            Ok(true) => self.notifier.emit(EngineEvent::BatchFinished {
                job_id: execution.job_id,
                batch_id,
            }),
            Ok(false) => {}
            Err(e) => {
                error!(job_id = execution.job_id, %batch_id, error = %e, "failed to check batch");
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use tokio::sync::broadcast;

    use crate::core::error::StoreError;
    use crate::core::events::InMemoryEventSink;
    use crate::core::registry::worker_fn;
    use crate::core::store::StoreResult;
    use crate::infra::store::InMemoryExecutionStore;
    use crate::util::{new_chain_id, BatchId, ChainId};

    /// In-memory store whose single-execution writes always fail.
    struct FullDiskStore {
        inner: InMemoryExecutionStore,
    }

    #[async_trait]
    impl ExecutionStore for FullDiskStore {
        async fn get_jobs(&self) -> StoreResult<Vec<Job>> {
            self.inner.get_jobs().await
        }
        async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
            self.inner.get_job(job_id).await
        }
        async fn persist_job(&self, job: Job) -> StoreResult<JobId> {
            self.inner.persist_job(job).await
        }
        async fn update_job(&self, job: &Job) -> StoreResult<()> {
            self.inner.update_job(job).await
        }
        async fn get_queued_executions(
            &self,
            job_id: JobId,
            limit: usize,
        ) -> StoreResult<Vec<Execution>> {
            self.inner.get_queued_executions(job_id, limit).await
        }
        async fn get_by_id(
            &self,
            job_id: JobId,
            id: ExecutionId,
        ) -> StoreResult<Option<Execution>> {
            self.inner.get_by_id(job_id, id).await
        }
        async fn update(
            &self,
            job_id: JobId,
            id: ExecutionId,
            execution: &Execution,
        ) -> StoreResult<()> {
            self.inner.update(job_id, id, execution).await
        }
        async fn transition(
            &self,
            job_id: JobId,
            id: ExecutionId,
            expected: ExecutionStatus,
            execution: &Execution,
        ) -> StoreResult<bool> {
            self.inner.transition(job_id, id, expected, execution).await
        }
        async fn persist(&self, _execution: Execution) -> StoreResult<ExecutionId> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn persist_batch(&self, executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>> {
            self.inner.persist_batch(executions).await
        }
        async fn persist_chain(&self, executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>> {
            self.inner.persist_chain(executions).await
        }
        async fn delete(&self, job_id: JobId, id: ExecutionId) -> StoreResult<()> {
            self.inner.delete(job_id, id).await
        }
        async fn get_next_in_chain(
            &self,
            job_id: JobId,
            chain_id: ChainId,
            previous_execution_id: ExecutionId,
        ) -> StoreResult<Option<Execution>> {
            self.inner
                .get_next_in_chain(job_id, chain_id, previous_execution_id)
                .await
        }
        async fn is_batch_finished(&self, job_id: JobId, batch_id: BatchId) -> StoreResult<bool> {
            self.inner.is_batch_finished(job_id, batch_id).await
        }
        async fn abort_chain(&self, job_id: JobId, chain_id: ChainId) -> StoreResult<usize> {
            self.inner.abort_chain(job_id, chain_id).await
        }
        async fn find_expired_executions(
            &self,
            older_than: DateTime<Utc>,
        ) -> StoreResult<Vec<Execution>> {
            self.inner.find_expired_executions(older_than).await
        }
        async fn find_queued_by_hash(
            &self,
            job_id: JobId,
            hash: &str,
        ) -> StoreResult<Option<Execution>> {
            self.inner.find_queued_by_hash(job_id, hash).await
        }
        async fn delete_terminal_before(
            &self,
            job_id: JobId,
            before: DateTime<Utc>,
        ) -> StoreResult<usize> {
            self.inner.delete_terminal_before(job_id, before).await
        }
        fn subscribe(&self) -> Option<broadcast::Receiver<Execution>> {
            None
        }
    }

    #[tokio::test]
    async fn unstorable_retry_aborts_the_rest_of_the_chain() {
        let store = Arc::new(FullDiskStore {
            inner: InMemoryExecutionStore::new(),
        });
        let job_id = store
            .persist_job(Job::new("chain", "boom").with_retries(2, 0))
            .await
            .unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        let chain = new_chain_id();
        let links = (0..3)
            .map(|_| {
                let mut e = Execution::new(job_id, None);
                e.chain_id = Some(chain);
                e
            })
            .collect();
        let ids = store.persist_chain(links).await.unwrap();

        let buffer = Arc::new(ExecutionBuffer::new());
        buffer.init_job(job_id, 1);
        buffer.enqueue(job_id, ids[0], false);
        let handle = buffer.register_worker(job_id).unwrap();

        let registry = Arc::new(WorkRegistry::new());
        registry.register(
            "boom",
            worker_fn(|_params: Option<Value>, _ctx: WorkContext| async {
                Err::<(), _>(anyhow::anyhow!("kaput"))
            }),
        );
        let notifier = Notifier::new();
        let sink = Arc::new(InMemoryEventSink::new(32));
        notifier.add_sink(sink.clone());

        let worker = Arc::new(WorkerLoop::new(
            store.clone(),
            Arc::clone(&buffer),
            registry,
            notifier,
        ));
        worker.run(job, handle).await;

        let head = store.get_by_id(job_id, ids[0]).await.unwrap().unwrap();
        assert_eq!(head.status, ExecutionStatus::Failed);
        assert_eq!(head.fail_message.as_deref(), Some("kaput"));
        for id in &ids[1..] {
            let link = store.get_by_id(job_id, *id).await.unwrap().unwrap();
            assert_eq!(link.status, ExecutionStatus::Aborted);
        }
        assert_eq!(
            sink.matching(|e| matches!(e, EngineEvent::ChainAborted { aborted: 2, .. }))
                .len(),
            1
        );
        assert_eq!(
            sink.matching(|e| matches!(e, EngineEvent::ExecutionFailed { .. }))
                .len(),
            1
        );
        assert!(sink
            .matching(|e| matches!(e, EngineEvent::RetryScheduled { .. }))
            .is_empty());
        assert_eq!(buffer.occupancy(job_id), 0);
    }

    #[tokio::test]
    async fn aborted_successor_is_not_run() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let job_id = store.persist_job(Job::new("chain", "count")).await.unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        let mut queued = Execution::new(job_id, None);
        let id = store.persist(queued.clone()).await.unwrap();
        queued.id = id;
        let mut aborted = queued.clone();
        aborted.status = ExecutionStatus::Aborted;
        store.update(job_id, id, &aborted).await.unwrap();

        let buffer = Arc::new(ExecutionBuffer::new());
        buffer.init_job(job_id, 1);
        assert!(buffer.take_for_run(job_id, id));
        let registry = Arc::new(WorkRegistry::new());
        registry.register(
            "count",
            worker_fn(|_params: Option<Value>, _ctx: WorkContext| async {
                Err::<(), _>(anyhow::anyhow!("must not run"))
            }),
        );
        let worker = WorkerLoop::new(store.clone(), Arc::clone(&buffer), registry, Notifier::new());

        // A stale QUEUED copy, as held by a slot across a retry delay.
        assert!(worker.execute(&job, queued).await.is_none());
        let stored = store.get_by_id(job_id, id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Aborted);
        assert_eq!(buffer.occupancy(job_id), 0);
    }
}
