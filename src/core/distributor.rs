//! Distributor: moves durable executions into the buffer and keeps each
//! active job's worker loops topped up.
//!
//! Two feeds reach [`Distributor::admit`]: the periodic poll, which also
//! reconciles the set of active jobs with the store, and the optional push
//! channel of the store. Worker loops are spawned through the [`Spawn`] seam
//! and registered with the buffer under the job lock before they start.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::core::buffer::ExecutionBuffer;
use crate::core::cron_trigger::CronTrigger;
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, Notifier};
use crate::core::model::{Execution, ExecutionStatus, Job, JobStatus};
use crate::core::registry::WorkRegistry;
use crate::core::spawn::{Spawn, StopToken};
use crate::core::store::ExecutionStore;
use crate::core::worker_loop::WorkerLoop;
use crate::util::{now, until, ExecutionId, JobId};

/// Set a job's stored status to `status` and raise a job error event.
///
/// Used for every engine configuration error (missing worker binding,
/// invalid schedule, worker start failure).
pub(crate) async fn disable_job(
    store: &dyn ExecutionStore,
    notifier: &Notifier,
    job_id: JobId,
    status: JobStatus,
    message: String,
) {
    let mut job = match store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            error!(job_id, message = %message, "cannot disable unknown job");
            return;
        }
        Err(e) => {
            error!(job_id, error = %e, message = %message, "cannot load job to disable it");
            return;
        }
    };
    let prior_status = job.status;
    job.status = status;
    if let Err(e) = store.update_job(&job).await {
        error!(job_id, error = %e, "failed to persist job status");
    }
    notifier.emit(EngineEvent::JobError {
        job_id,
        prior_status,
        message,
    });
}

/// Feeds the execution buffer and spawns worker loops.
pub struct Distributor<S> {
    store: Arc<dyn ExecutionStore>,
    buffer: Arc<ExecutionBuffer>,
    registry: Arc<WorkRegistry>,
    notifier: Notifier,
    worker: Arc<WorkerLoop>,
    cron: Arc<CronTrigger<S>>,
    config: SharedConfig,
    spawner: S,
    active: RwLock<HashMap<JobId, Job>>,
    stop: Mutex<Option<StopToken>>,
}

impl<S> Distributor<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Wire a distributor. Nothing runs until [`Self::start`] or
    /// [`Self::poll`].
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        buffer: Arc<ExecutionBuffer>,
        registry: Arc<WorkRegistry>,
        notifier: Notifier,
        cron: Arc<CronTrigger<S>>,
        config: SharedConfig,
        spawner: S,
    ) -> Self {
        let worker = Arc::new(WorkerLoop::new(
            Arc::clone(&store),
            Arc::clone(&buffer),
            Arc::clone(&registry),
            notifier.clone(),
        ));
        Self {
            store,
            buffer,
            registry,
            notifier,
            worker,
            cron,
            config,
            spawner,
            active: RwLock::new(HashMap::new()),
            stop: Mutex::new(None),
        }
    }

    /// Start the poll loop, and the push listener when the store can
    /// notify. Idempotent; returns false if already running.
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

        self.spawner.spawn(Arc::clone(self).poll_loop(stop.clone()));
        match self.store.subscribe() {
            Some(rx) => {
                self.spawner.spawn(Arc::clone(self).listen(rx, stop));
                info!("distributor started with push notifications");
            }
            None => info!("distributor started, polling only"),
        }
        true
    }

    /// Stop the poll loop and push listener. Active jobs keep their buffers;
    /// see [`Self::deactivate_all`]. Idempotent.
    pub fn stop(&self) -> bool {
        self.stop.lock().take().is_some_and(|stop| {
            stop.stop();
            info!("distributor stopped");
            true
        })
    }

    /// Whether the poll loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    async fn poll_loop(self: Arc<Self>, stop: StopToken) {
        loop {
            self.poll().await;
            let interval = self.config.read().poll_interval();
            tokio::select! {
                () = stop.stopped() => return,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn listen(self: Arc<Self>, mut rx: broadcast::Receiver<Execution>, stop: StopToken) {
        loop {
            tokio::select! {
                () = stop.stopped() => return,
                received = rx.recv() => match received {
                    Ok(execution) => self.on_pushed(execution, &stop),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push notifications lagged, next poll catches up");
                    }
                    Err(RecvError::Closed) => {
                        info!("push channel closed, polling only");
                        return;
                    }
                },
            }
        }
    }

    fn on_pushed(self: &Arc<Self>, execution: Execution, stop: &StopToken) {
        // Later chain links are fetched by the worker running their predecessor.
        if execution.is_chain_continuation() || !self.is_active(execution.job_id) {
            return;
        }
        if execution.is_mature(now()) {
            self.admit(&execution);
            return;
        }
        let Some(maturity) = execution.maturity else {
            return;
        };
        debug!(job_id = execution.job_id, execution_id = execution.id, %maturity, "deferring immature execution");
        let this = Arc::clone(self);
        let stop = stop.clone();
        self.spawner.spawn(async move {
            tokio::select! {
                () = stop.stopped() => {}
                () = tokio::time::sleep(until(maturity)) => {
                    this.admit_by_id(execution.job_id, execution.id).await;
                }
            }
        });
    }

    /// Re-read an execution and admit it if it is still QUEUED.
    async fn admit_by_id(&self, job_id: JobId, id: ExecutionId) -> bool {
        match self.store.get_by_id(job_id, id).await {
            Ok(Some(execution)) => self.admit(&execution),
            Ok(None) => false,
            Err(e) => {
                error!(job_id, execution_id = id, error = %e, "failed to reload deferred execution");
                false
            }
        }
    }

    /// One distributor pass: reconcile active jobs with the store, then
    /// refill every active buffer whose occupancy is below the low-water
    /// mark with up to high-water-mark executions.
    pub async fn poll(&self) {
        self.reconcile().await;
        let (low_water, high_water) = {
            let cfg = self.config.read();
            (cfg.buffer_low_water, cfg.buffer_high_water)
        };
        let job_ids: Vec<JobId> = self.active.read().keys().copied().collect();
        for job_id in job_ids {
            if self.buffer.occupancy(job_id) >= low_water {
                continue;
            }
            match self.store.get_queued_executions(job_id, high_water).await {
                Ok(executions) => {
                    let admitted = executions.iter().filter(|e| self.admit(e)).count();
                    if admitted > 0 {
                        debug!(job_id, admitted, "buffer refilled");
                    }
                }
                Err(e) => error!(job_id, error = %e, "failed to fetch queued executions"),
            }
        }
    }

    /// Bring the active set in line with the stored jobs.
    pub async fn reconcile(&self) {
        let jobs = match self.store.get_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list jobs");
                return;
            }
        };
        let stored: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let vanished: Vec<JobId> = self
            .active
            .read()
            .keys()
            .filter(|id| !stored.contains(id))
            .copied()
            .collect();
        for job_id in vanished {
            self.deactivate(job_id);
        }
        for job in jobs {
            self.sync_job(job).await;
        }
    }

    /// Re-read one job from the store and apply its status and
    /// configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`] and store failures.
    pub async fn refresh_job(&self, job_id: JobId) -> Result<(), EngineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        self.sync_job(job).await;
        Ok(())
    }

    async fn sync_job(&self, job: Job) {
        let current = self.active.read().get(&job.id).cloned();
        match (job.status == JobStatus::Active, current) {
            (true, Some(current)) if current == job => {}
            (true, current) => {
                let job_id = job.id;
                if current.is_some() {
                    info!(job_id, "job configuration changed, rebuilding buffer");
                    self.deactivate(job_id);
                }
                if let Err(e) = self.activate(job).await {
                    warn!(job_id, error = %e, "job not activated");
                }
            }
            (false, Some(_)) => {
                self.deactivate(job.id);
            }
            (false, None) => {}
        }
    }

    /// Create buffer state for an ACTIVE job, arm its cron timer and admit
    /// its queued executions.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobInactive`] when the job is not ACTIVE,
    /// [`EngineError::NoWorker`] when its worker reference is unbound (the
    /// job is set to NO_WORKER), [`EngineError::InvalidSchedule`] when its
    /// schedule does not parse (the job is set to ERROR).
    pub async fn activate(&self, job: Job) -> Result<(), EngineError> {
        if job.status != JobStatus::Active {
            return Err(EngineError::JobInactive(job.id));
        }
        if let Err(e) = self.registry.ensure_bound(&job.worker_ref) {
            disable_job(&*self.store, &self.notifier, job.id, JobStatus::NoWorker, e.to_string()).await;
            return Err(e);
        }

        let job_id = job.id;
        self.buffer.init_job(job_id, job.threads);
        self.active.write().insert(job_id, job.clone());
        if let Err(e) = self.cron.start_job(&job).await {
            self.active.write().remove(&job_id);
            self.buffer.remove_job(job_id);
            return Err(e);
        }
        info!(job_id, name = %job.name, threads = job.threads, "job activated");

        let high_water = self.config.read().buffer_high_water;
        match self.store.get_queued_executions(job_id, high_water).await {
            Ok(executions) => {
                for execution in &executions {
                    self.admit(execution);
                }
            }
            Err(e) => error!(job_id, error = %e, "failed to fetch queued executions"),
        }
        Ok(())
    }

    /// Tear down a job: cancel its timer, clear its queues and ask its worker
    /// loops to stop after their current run. Queued executions stay QUEUED
    /// in the store. Returns whether the job was active.
    pub fn deactivate(&self, job_id: JobId) -> bool {
        self.cron.stop_job(job_id);
        let was_active = self.active.write().remove(&job_id).is_some();
        self.buffer.remove_job(job_id);
        if was_active {
            info!(job_id, "job deactivated");
        }
        was_active
    }

    /// Deactivate every job.
    pub fn deactivate_all(&self) {
        let job_ids: Vec<JobId> = self.active.read().keys().copied().collect();
        for job_id in job_ids {
            self.deactivate(job_id);
        }
    }

    /// Whether the job currently has buffer state here.
    #[must_use]
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.active.read().contains_key(&job_id)
    }

    /// Active job ids.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.active.read().keys().copied().collect()
    }

    /// Enqueue a QUEUED execution of an active job and top up its worker
    /// loops. Returns false when the execution is not QUEUED, its job is not
    /// active, or it is already queued or running.
    pub fn admit(&self, execution: &Execution) -> bool {
        if execution.status != ExecutionStatus::Queued {
            return false;
        }
        let Some(job) = self.active.read().get(&execution.job_id).cloned() else {
            debug!(job_id = execution.job_id, execution_id = execution.id, "job not active, execution left in store");
            return false;
        };
        if !self.buffer.enqueue(job.id, execution.id, execution.priority) {
            return false;
        }
        self.top_up(&job);
        true
    }

    /// Start worker loops one at a time until the running count reaches the
    /// desired concurrency.
    fn top_up(&self, job: &Job) {
        loop {
            match self.buffer.reserve_worker(job.id) {
                Ok(Some(handle)) => {
                    debug!(job_id = job.id, worker_id = handle.id, "starting worker loop");
                    let worker = Arc::clone(&self.worker);
                    self.spawner.spawn(worker.run(job.clone(), handle));
                }
                Ok(None) => return,
                Err(e) => {
                    self.fail_worker_start(job.id, &e);
                    return;
                }
            }
        }
    }

    fn fail_worker_start(&self, job_id: JobId, err: &EngineError) {
        error!(job_id, error = %err, "worker loop could not start");
        self.cron.stop_job(job_id);
        self.active.write().remove(&job_id);
        self.buffer.remove_job(job_id);
        let store = Arc::clone(&self.store);
        let notifier = self.notifier.clone();
        let message = format!("worker loop could not start: {err}");
        self.spawner.spawn(async move {
            disable_job(&*store, &notifier, job_id, JobStatus::Error, message).await;
        });
    }
}
