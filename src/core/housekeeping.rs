//! Periodic maintenance: zombie reclassification and retention clean-up.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::SharedConfig;
use crate::core::buffer::ExecutionBuffer;
use crate::core::events::{EngineEvent, Notifier};
use crate::core::model::{Execution, ExecutionStatus};
use crate::core::spawn::{Spawn, StopToken};
use crate::core::store::ExecutionStore;
use crate::util::now;

/// Counts of one [`Housekeeper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingReport {
    /// RUNNING executions failed for exceeding the maximum running age.
    pub zombies: usize,
    /// Terminal executions deleted by retention.
    pub cleaned: usize,
}

/// Runs zombie detection and retention on an interval.
pub struct Housekeeper<S> {
    store: Arc<dyn ExecutionStore>,
    buffer: Arc<ExecutionBuffer>,
    notifier: Notifier,
    config: SharedConfig,
    spawner: S,
    stop: Mutex<Option<StopToken>>,
}

impl<S> Housekeeper<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Idle housekeeper.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        buffer: Arc<ExecutionBuffer>,
        notifier: Notifier,
        config: SharedConfig,
        spawner: S,
    ) -> Self {
        Self {
            store,
            buffer,
            notifier,
            config,
            spawner,
            stop: Mutex::new(None),
        }
    }

    /// Start sweeping on the configured interval. Idempotent.
    pub fn start(self: &Arc<Self>) -> bool {
        let stop = {
            let mut slot = self.stop.lock();
            if slot.is_some() {
                return false;
            }
            let stop = StopToken::new();
            *slot = Some(stop.clone());
            stop
        };
        let this = Arc::clone(self);
        self.spawner.spawn(async move {
            loop {
                let interval = this.config.read().housekeeping_interval();
                tokio::select! {
                    () = stop.stopped() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                this.sweep().await;
            }
        });
        true
    }

    /// Stop sweeping. Idempotent.
    pub fn stop(&self) -> bool {
        self.stop.lock().take().is_some_and(|stop| {
            stop.stop();
            true
        })
    }

    /// Run both maintenance passes once.
    pub async fn sweep(&self) -> HousekeepingReport {
        let report = HousekeepingReport {
            zombies: self.reclassify_zombies().await,
            cleaned: self.clean_up().await,
        };
        if report != HousekeepingReport::default() {
            info!(zombies = report.zombies, cleaned = report.cleaned, "housekeeping sweep");
        }
        report
    }

    async fn reclassify_zombies(&self) -> usize {
        let Some(max_age) = self.config.read().zombie_max_age() else {
            return 0;
        };
        let Ok(max_age) = ChronoDuration::from_std(max_age) else {
            return 0;
        };
        let expired = match self.store.find_expired_executions(now() - max_age).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "zombie lookup failed");
                return 0;
            }
        };
        let mut reclassified = 0;
        for execution in expired {
            if self.reclassify(execution, max_age).await {
                reclassified += 1;
            }
        }
        reclassified
    }

    async fn reclassify(&self, mut execution: Execution, max_age: ChronoDuration) -> bool {
        let (job_id, id) = (execution.job_id, execution.id);
        execution.status = ExecutionStatus::Failed;
        execution.ended_at = Some(now());
        execution.fail_message = Some(format!(
            "execution exceeded the maximum running age of {}s",
            max_age.num_seconds()
        ));
        match self
            .store
            .transition(job_id, id, ExecutionStatus::Running, &execution)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id, execution_id = id, "zombie candidate ended before reclassification");
                return false;
            }
            Err(e) => {
                error!(job_id, execution_id = id, error = %e, "failed to reclassify zombie");
                return false;
            }
        }
        self.buffer.unmark_running(job_id, id);
        self.notifier
            .emit(EngineEvent::ZombieReclassified { job_id, execution_id: id });

        if let Some(chain_id) = execution.chain_id {
            match self.store.abort_chain(job_id, chain_id).await {
                Ok(aborted) => self.notifier.emit(EngineEvent::ChainAborted {
                    job_id,
                    chain_id,
                    aborted,
                }),
                Err(e) => error!(job_id, %chain_id, error = %e, "failed to abort zombie chain"),
            }
        }
        true
    }

    async fn clean_up(&self) -> usize {
        let jobs = match self.store.get_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "retention lookup failed");
                return 0;
            }
        };
        let mut cleaned = 0;
        for job in jobs {
            let Some(days) = job.days_until_clean_up else {
                continue;
            };
            let before = now() - ChronoDuration::days(i64::from(days));
            match self.store.delete_terminal_before(job.id, before).await {
                Ok(0) => {}
                Ok(n) => {
                    debug!(job_id = job.id, deleted = n, days, "retention clean-up");
                    cleaned += n;
                }
                Err(e) => error!(job_id = job.id, error = %e, "retention clean-up failed"),
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::model::Job;
    use crate::core::InMemoryEventSink;
    use crate::infra::store::InMemoryExecutionStore;
    use crate::runtime::TokioSpawner;
    use crate::util::new_chain_id;

    fn housekeeper(
        store: Arc<InMemoryExecutionStore>,
        zombie_max_age_secs: Option<u64>,
    ) -> (Housekeeper<TokioSpawner>, Arc<InMemoryEventSink>) {
        let notifier = Notifier::new();
        let sink = Arc::new(InMemoryEventSink::new(16));
        notifier.add_sink(sink.clone());
        let config = EngineConfig {
            zombie_max_age_secs,
            ..EngineConfig::default()
        }
        .into_shared();
        let keeper = Housekeeper::new(
            store,
            Arc::new(ExecutionBuffer::new()),
            notifier,
            config,
            TokioSpawner::current(),
        );
        (keeper, sink)
    }

    #[tokio::test]
    async fn stale_running_execution_becomes_failed() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let chain = new_chain_id();
        let links = (0..2)
            .map(|_| {
                let mut e = Execution::new(1, None);
                e.chain_id = Some(chain);
                e
            })
            .collect();
        let ids = store.persist_chain(links).await.unwrap();
        let mut head = store.get_by_id(1, ids[0]).await.unwrap().unwrap();
        head.status = ExecutionStatus::Running;
        head.started_at = Some(now() - ChronoDuration::minutes(30));
        store.update(1, ids[0], &head).await.unwrap();

        let (keeper, sink) = housekeeper(store.clone(), Some(600));
        let report = keeper.sweep().await;
        assert_eq!(report.zombies, 1);

        let head = store.get_by_id(1, ids[0]).await.unwrap().unwrap();
        assert_eq!(head.status, ExecutionStatus::Failed);
        let tail = store.get_by_id(1, ids[1]).await.unwrap().unwrap();
        assert_eq!(tail.status, ExecutionStatus::Aborted);
        assert_eq!(
            sink.matching(|e| matches!(e, EngineEvent::ZombieReclassified { .. }))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn zombie_detection_off_without_max_age() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let id = store.persist(Execution::new(1, None)).await.unwrap();
        let mut e = store.get_by_id(1, id).await.unwrap().unwrap();
        e.status = ExecutionStatus::Running;
        e.started_at = Some(now() - ChronoDuration::days(3));
        store.update(1, id, &e).await.unwrap();

        let (keeper, _) = housekeeper(store, None);
        assert_eq!(keeper.sweep().await.zombies, 0);
    }

    #[tokio::test]
    async fn retention_removes_old_terminal_executions() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut job = Job::new("j", "w");
        job.days_until_clean_up = Some(7);
        let job_id = store.persist_job(job).await.unwrap();

        let mut old = Execution::new(job_id, None);
        old.status = ExecutionStatus::Finished;
        old.created_at = now() - ChronoDuration::days(8);
        store.persist(old).await.unwrap();
        let mut recent = Execution::new(job_id, None);
        recent.status = ExecutionStatus::Finished;
        store.persist(recent).await.unwrap();

        let (keeper, _) = housekeeper(store.clone(), None);
        assert_eq!(keeper.sweep().await.cleaned, 1);
        assert_eq!(store.executions_of(job_id).len(), 1);
    }
}
