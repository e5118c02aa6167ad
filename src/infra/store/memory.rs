//! In-memory execution store with push notifications.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::core::error::StoreError;
use crate::core::model::{Execution, ExecutionStatus, Job};
use crate::core::store::{ExecutionStore, StoreResult};
use crate::util::{BatchId, ChainId, ExecutionId, JobId};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    jobs: BTreeMap<JobId, Job>,
    executions: BTreeMap<ExecutionId, Execution>,
}

/// Process-local store for development, tests and single-process embedding.
///
/// Ids are assigned from monotonically increasing counters starting at 1.
/// Every persisted QUEUED execution (chain heads only, for chains) is
/// broadcast to subscribers.
pub struct InMemoryExecutionStore {
    state: RwLock<StoreState>,
    next_job_id: AtomicU64,
    next_execution_id: AtomicU64,
    notify: broadcast::Sender<Execution>,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            next_job_id: AtomicU64::new(1),
            next_execution_id: AtomicU64::new(1),
            notify,
        }
    }

    /// All executions of a job, in id order.
    #[must_use]
    pub fn executions_of(&self, job_id: JobId) -> Vec<Execution> {
        self.state
            .read()
            .executions
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    fn assign_id(&self) -> ExecutionId {
        self.next_execution_id.fetch_add(1, Ordering::Relaxed)
    }

    fn announce(&self, execution: &Execution) {
        if execution.status == ExecutionStatus::Queued {
            // No subscribers is fine.
            let _ = self.notify.send(execution.clone());
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self.state.read().jobs.values().cloned().collect())
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.read().jobs.get(&job_id).cloned())
    }

    async fn persist_job(&self, mut job: Job) -> StoreResult<JobId> {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        job.id = id;
        self.state.write().jobs.insert(id, job);
        Ok(id)
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let mut state = self.state.write();
        let slot = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        *slot = job.clone();
        Ok(())
    }

    async fn get_queued_executions(
        &self,
        job_id: JobId,
        limit: usize,
    ) -> StoreResult<Vec<Execution>> {
        let now = Utc::now();
        let state = self.state.read();
        let mut queued: Vec<&Execution> = state
            .executions
            .values()
            .filter(|e| {
                e.job_id == job_id
                    && e.status == ExecutionStatus::Queued
                    && e.is_mature(now)
                    && !e.is_chain_continuation()
            })
            .collect();
        queued.sort_by_key(|e| (Reverse(e.priority), e.created_at, e.id));
        Ok(queued.into_iter().take(limit).cloned().collect())
    }

    async fn get_by_id(&self, job_id: JobId, id: ExecutionId) -> StoreResult<Option<Execution>> {
        Ok(self
            .state
            .read()
            .executions
            .get(&id)
            .filter(|e| e.job_id == job_id)
            .cloned())
    }

    async fn update(
        &self,
        job_id: JobId,
        id: ExecutionId,
        execution: &Execution,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        match state.executions.get_mut(&id) {
            Some(slot) if slot.job_id == job_id => {
                *slot = execution.clone();
                slot.id = id;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("execution {id} of job {job_id}"))),
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        id: ExecutionId,
        expected: ExecutionStatus,
        execution: &Execution,
    ) -> StoreResult<bool> {
        let mut state = self.state.write();
        match state.executions.get_mut(&id) {
            Some(slot) if slot.job_id == job_id => {
                if slot.status != expected {
                    return Ok(false);
                }
                *slot = execution.clone();
                slot.id = id;
                Ok(true)
            }
            _ => Err(StoreError::NotFound(format!("execution {id} of job {job_id}"))),
        }
    }

    async fn persist(&self, mut execution: Execution) -> StoreResult<ExecutionId> {
        let id = self.assign_id();
        execution.id = id;
        self.state.write().executions.insert(id, execution.clone());
        self.announce(&execution);
        Ok(id)
    }

    async fn persist_batch(&self, executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>> {
        let mut stored = Vec::with_capacity(executions.len());
        {
            let mut state = self.state.write();
            for mut execution in executions {
                execution.id = self.assign_id();
                state.executions.insert(execution.id, execution.clone());
                stored.push(execution);
            }
        }
        for execution in &stored {
            self.announce(execution);
        }
        Ok(stored.into_iter().map(|e| e.id).collect())
    }

    async fn persist_chain(&self, mut executions: Vec<Execution>) -> StoreResult<Vec<ExecutionId>> {
        let ids: Vec<ExecutionId> = executions.iter().map(|_| self.assign_id()).collect();
        for (i, execution) in executions.iter_mut().enumerate() {
            execution.id = ids[i];
            execution.chained_previous_execution_id = i.checked_sub(1).map(|p| ids[p]);
            execution.chained_next_execution_id = ids.get(i + 1).copied();
        }
        {
            let mut state = self.state.write();
            for execution in &executions {
                state.executions.insert(execution.id, execution.clone());
            }
        }
        if let Some(head) = executions.first() {
            self.announce(head);
        }
        Ok(ids)
    }

    async fn delete(&self, job_id: JobId, id: ExecutionId) -> StoreResult<()> {
        let mut state = self.state.write();
        match state.executions.get(&id) {
            Some(e) if e.job_id == job_id => {
                state.executions.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("execution {id} of job {job_id}"))),
        }
    }

    async fn get_next_in_chain(
        &self,
        job_id: JobId,
        chain_id: ChainId,
        previous_execution_id: ExecutionId,
    ) -> StoreResult<Option<Execution>> {
        Ok(self
            .state
            .read()
            .executions
            .values()
            .find(|e| {
                e.job_id == job_id
                    && e.status == ExecutionStatus::Queued
                    && e.chain_id == Some(chain_id)
                    && e.chained_previous_execution_id == Some(previous_execution_id)
            })
            .cloned())
    }

    async fn is_batch_finished(&self, job_id: JobId, batch_id: BatchId) -> StoreResult<bool> {
        Ok(!self.state.read().executions.values().any(|e| {
            e.job_id == job_id
                && e.batch_id == Some(batch_id)
                && e.status == ExecutionStatus::Queued
        }))
    }

    async fn abort_chain(&self, job_id: JobId, chain_id: ChainId) -> StoreResult<usize> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut aborted = 0;
        for e in state.executions.values_mut().filter(|e| {
            e.job_id == job_id
                && e.chain_id == Some(chain_id)
                && e.status == ExecutionStatus::Queued
        }) {
            e.status = ExecutionStatus::Aborted;
            e.ended_at = Some(now);
            aborted += 1;
        }
        Ok(aborted)
    }

    async fn find_expired_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<Execution>> {
        Ok(self
            .state
            .read()
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Running && e.started_at.is_some_and(|s| s < older_than)
            })
            .cloned()
            .collect())
    }

    async fn find_queued_by_hash(
        &self,
        job_id: JobId,
        hash: &str,
    ) -> StoreResult<Option<Execution>> {
        Ok(self
            .state
            .read()
            .executions
            .values()
            .find(|e| {
                e.job_id == job_id
                    && e.status == ExecutionStatus::Queued
                    && e.parameters_hash.as_deref() == Some(hash)
            })
            .cloned())
    }

    async fn delete_terminal_before(
        &self,
        job_id: JobId,
        before: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut state = self.state.write();
        let len = state.executions.len();
        state.executions.retain(|_, e| {
            !(e.job_id == job_id && e.status.is_terminal() && e.created_at < before)
        });
        Ok(len - state.executions.len())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Execution>> {
        Some(self.notify.subscribe())
    }
}
