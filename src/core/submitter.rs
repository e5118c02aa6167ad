//! Creation of executions: single, batch and chain, plus administrative abort.
//!
//! Every producer (API, cron trigger, applications) goes through
//! [`ExecutionSubmitter`], so queue uniqueness for `unique_in_queue` jobs is
//! enforced in one place. The check and the insert run under a per-job async
//! lock; without it two concurrent submissions with the same payload could
//! both pass the check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::core::model::{Execution, ExecutionStatus, Job};
use crate::core::store::ExecutionStore;
use crate::util::{new_batch_id, new_chain_id, now, ExecutionId, JobId};

/// What a producer asks for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    /// Payload handed to the worker.
    pub parameters: Option<Value>,
    /// Dispatch before normal executions.
    pub priority: bool,
    /// Not-before timestamp.
    pub maturity: Option<DateTime<Utc>>,
}

impl ExecutionRequest {
    /// Request with a payload and default dispatch options.
    #[must_use]
    pub fn with_parameters(parameters: Value) -> Self {
        Self {
            parameters: Some(parameters),
            priority: false,
            maturity: None,
        }
    }

    fn into_execution(self, job_id: JobId) -> Execution {
        let mut execution = Execution::new(job_id, self.parameters).with_priority(self.priority);
        execution.maturity = self.maturity;
        execution
    }
}

/// Result of [`ExecutionSubmitter::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    /// The stored execution: the new one, or the queued duplicate.
    pub execution: Execution,
    /// False when a queued execution with the same payload already existed.
    pub created: bool,
}

/// Ids of a submitted batch or chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedGroup {
    /// Batch or chain id.
    pub group_id: Uuid,
    /// Member ids in submission order.
    pub execution_ids: Vec<ExecutionId>,
}

/// Creates executions in the store.
pub struct ExecutionSubmitter {
    store: Arc<dyn ExecutionStore>,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExecutionSubmitter {
    /// Submitter over `store`.
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn job(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    fn lock_for(&self, job_id: JobId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(job_id).or_default())
    }

    /// Create one QUEUED execution.
    ///
    /// For `unique_in_queue` jobs an existing QUEUED execution with the same
    /// parameter hash is returned instead and nothing is created.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`] for unknown jobs, [`EngineError::Store`]
    /// on backend failures.
    pub async fn submit(
        &self,
        job_id: JobId,
        request: ExecutionRequest,
    ) -> Result<SubmitOutcome, EngineError> {
        let job = self.job(job_id).await?;
        let execution = request.into_execution(job_id);
        if !job.unique_in_queue {
            return self.persist_new(execution).await;
        }

        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;
        if let Some(hash) = execution.parameters_hash.as_deref() {
            if let Some(existing) = self.store.find_queued_by_hash(job_id, hash).await? {
                debug!(job_id, execution_id = existing.id, "identical execution already queued");
                return Ok(SubmitOutcome {
                    execution: existing,
                    created: false,
                });
            }
        }
        self.persist_new(execution).await
    }

    async fn persist_new(&self, mut execution: Execution) -> Result<SubmitOutcome, EngineError> {
        execution.id = self.store.persist(execution.clone()).await?;
        debug!(job_id = execution.job_id, execution_id = execution.id, priority = execution.priority, "execution queued");
        Ok(SubmitOutcome {
            execution,
            created: true,
        })
    }

    /// Create a batch: unordered executions sharing a fresh batch id.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyGroup`] for an empty request list, plus the
    /// errors of [`Self::submit`].
    pub async fn submit_batch(
        &self,
        job_id: JobId,
        requests: Vec<ExecutionRequest>,
    ) -> Result<SubmittedGroup, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::EmptyGroup("batch"));
        }
        self.job(job_id).await?;
        let batch_id = new_batch_id();
        let members = requests
            .into_iter()
            .map(|request| {
                let mut execution = request.into_execution(job_id);
                execution.batch_id = Some(batch_id);
                execution
            })
            .collect();
        let execution_ids = self.store.persist_batch(members).await?;
        info!(job_id, %batch_id, size = execution_ids.len(), "batch queued");
        Ok(SubmittedGroup {
            group_id: batch_id,
            execution_ids,
        })
    }

    /// Create a chain: executions that run strictly one after another, in
    /// request order. Only the head is dispatched through the buffer.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyGroup`] for an empty request list, plus the
    /// errors of [`Self::submit`].
    pub async fn submit_chain(
        &self,
        job_id: JobId,
        requests: Vec<ExecutionRequest>,
    ) -> Result<SubmittedGroup, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::EmptyGroup("chain"));
        }
        self.job(job_id).await?;
        let chain_id = new_chain_id();
        let links = requests
            .into_iter()
            .map(|request| {
                let mut execution = request.into_execution(job_id);
                execution.chain_id = Some(chain_id);
                execution
            })
            .collect();
        let execution_ids = self.store.persist_chain(links).await?;
        info!(job_id, %chain_id, size = execution_ids.len(), "chain queued");
        Ok(SubmittedGroup {
            group_id: chain_id,
            execution_ids,
        })
    }

    /// Abort a QUEUED execution. Aborting a chain member aborts every queued
    /// member of its chain, since later links could never run. Returns
    /// false when the execution already left QUEUED.
    ///
    /// # Errors
    ///
    /// [`EngineError::ExecutionNotFound`] for unknown executions,
    /// [`EngineError::Store`] on backend failures.
    pub async fn abort(&self, job_id: JobId, execution_id: ExecutionId) -> Result<bool, EngineError> {
        let mut execution = self
            .store
            .get_by_id(job_id, execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound {
                job_id,
                execution_id,
            })?;
        if execution.status != ExecutionStatus::Queued {
            return Ok(false);
        }
        if let Some(chain_id) = execution.chain_id {
            let aborted = self.store.abort_chain(job_id, chain_id).await?;
            info!(job_id, execution_id, %chain_id, aborted, "chain aborted by request");
            return Ok(aborted > 0);
        }
        execution.status = ExecutionStatus::Aborted;
        execution.ended_at = Some(now());
        let aborted = self
            .store
            .transition(job_id, execution_id, ExecutionStatus::Queued, &execution)
            .await?;
        if aborted {
            info!(job_id, execution_id, "execution aborted by request");
        }
        Ok(aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::store::InMemoryExecutionStore;
    use serde_json::json;

    async fn setup(unique: bool) -> (Arc<InMemoryExecutionStore>, ExecutionSubmitter, JobId) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let job_id = store
            .persist_job(Job::new("j", "w").with_unique_in_queue(unique))
            .await
            .unwrap();
        let submitter = ExecutionSubmitter::new(store.clone());
        (store, submitter, job_id)
    }

    #[tokio::test]
    async fn unique_job_keeps_one_queued_copy() {
        let (store, submitter, job_id) = setup(true).await;
        let first = submitter
            .submit(job_id, ExecutionRequest::with_parameters(json!({"to": "a"})))
            .await
            .unwrap();
        let second = submitter
            .submit(job_id, ExecutionRequest::with_parameters(json!({"to": "a"})))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.execution.id, second.execution.id);

        let other = submitter
            .submit(job_id, ExecutionRequest::with_parameters(json!({"to": "b"})))
            .await
            .unwrap();
        assert!(other.created);
        assert_eq!(store.executions_of(job_id).len(), 2);
    }

    #[tokio::test]
    async fn concurrent_unique_submissions_create_one() {
        let (store, submitter, job_id) = setup(true).await;
        let submitter = Arc::new(submitter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let submitter = Arc::clone(&submitter);
                tokio::spawn(async move { submitter.submit(job_id, ExecutionRequest::default()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.executions_of(job_id).len(), 1);
    }

    #[tokio::test]
    async fn non_unique_job_accepts_duplicates() {
        let (store, submitter, job_id) = setup(false).await;
        for _ in 0..2 {
            assert!(submitter.submit(job_id, ExecutionRequest::default()).await.unwrap().created);
        }
        assert_eq!(store.executions_of(job_id).len(), 2);
    }

    #[tokio::test]
    async fn empty_groups_are_rejected() {
        let (_, submitter, job_id) = setup(false).await;
        assert!(matches!(
            submitter.submit_batch(job_id, vec![]).await,
            Err(EngineError::EmptyGroup("batch"))
        ));
        assert!(matches!(
            submitter.submit_chain(job_id, vec![]).await,
            Err(EngineError::EmptyGroup("chain"))
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_rejected() {
        let (_, submitter, _) = setup(false).await;
        assert!(matches!(
            submitter.submit(99, ExecutionRequest::default()).await,
            Err(EngineError::JobNotFound(99))
        ));
    }

    #[tokio::test]
    async fn aborting_a_chain_link_aborts_the_chain() {
        let (store, submitter, job_id) = setup(false).await;
        let chain = submitter
            .submit_chain(job_id, vec![ExecutionRequest::default(); 3])
            .await
            .unwrap();
        assert!(submitter.abort(job_id, chain.execution_ids[1]).await.unwrap());
        assert!(store
            .executions_of(job_id)
            .iter()
            .all(|e| e.status == ExecutionStatus::Aborted));
        assert!(!submitter.abort(job_id, chain.execution_ids[0]).await.unwrap());
    }
}
