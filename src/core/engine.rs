//! Engine facade wiring every component together.

use std::sync::Arc;

use tracing::info;

use crate::config::{EngineConfig, SharedConfig};
use crate::core::buffer::{BufferSnapshot, ExecutionBuffer};
use crate::core::cron_trigger::CronTrigger;
use crate::core::distributor::Distributor;
use crate::core::error::EngineError;
use crate::core::events::{EventSink, InMemoryEventSink, Notifier};
use crate::core::housekeeping::{Housekeeper, HousekeepingReport};
use crate::core::model::{Execution, Job, JobStatus};
use crate::core::registry::WorkRegistry;
use crate::core::spawn::Spawn;
use crate::core::store::ExecutionStore;
use crate::core::submitter::{ExecutionRequest, ExecutionSubmitter, SubmitOutcome, SubmittedGroup};
use crate::runtime::TokioSpawner;
use crate::util::{ExecutionId, JobId};

/// Embeddable background-job engine.
///
/// ```rust,ignore
/// let engine = Engine::new(EngineConfig::default(), store, registry, TokioSpawner::current())?;
/// let job_id = engine.register_job(Job::new("mail", "send_mail").with_threads(4)).await?;
/// engine.start().await;
/// engine.submit(job_id, ExecutionRequest::with_parameters(json!({"to": "a@b.c"}))).await?;
/// ```
pub struct Engine<S = TokioSpawner>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    config: SharedConfig,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<WorkRegistry>,
    buffer: Arc<ExecutionBuffer>,
    notifier: Notifier,
    history: Arc<InMemoryEventSink>,
    submitter: Arc<ExecutionSubmitter>,
    cron: Arc<CronTrigger<S>>,
    distributor: Arc<Distributor<S>>,
    housekeeper: Arc<Housekeeper<S>>,
}

impl<S> Engine<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Wire an engine. Nothing runs until [`Self::start`].
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] when `config` fails validation.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<WorkRegistry>,
        spawner: S,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let history = Arc::new(InMemoryEventSink::new(config.event_history));
        let config = config.into_shared();

        let notifier = Notifier::new();
        notifier.add_sink(history.clone());
        let buffer = Arc::new(ExecutionBuffer::new());
        let submitter = Arc::new(ExecutionSubmitter::new(Arc::clone(&store)));
        let cron = Arc::new(CronTrigger::new(
            Arc::clone(&store),
            Arc::clone(&submitter),
            notifier.clone(),
            spawner.clone(),
        ));
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&store),
            Arc::clone(&buffer),
            Arc::clone(&registry),
            notifier.clone(),
            Arc::clone(&cron),
            Arc::clone(&config),
            spawner.clone(),
        ));
        let housekeeper = Arc::new(Housekeeper::new(
            Arc::clone(&store),
            Arc::clone(&buffer),
            notifier.clone(),
            Arc::clone(&config),
            spawner,
        ));

        Ok(Self {
            config,
            store,
            registry,
            buffer,
            notifier,
            history,
            submitter,
            cron,
            distributor,
            housekeeper,
        })
    }

    /// Activate all ACTIVE jobs, then start polling, push handling and
    /// housekeeping. Idempotent.
    pub async fn start(&self) {
        if self.distributor.is_running() {
            return;
        }
        self.distributor.poll().await;
        self.distributor.start();
        self.housekeeper.start();
        info!(active_jobs = self.distributor.active_jobs().len(), "engine started");
    }

    /// Stop every loop and timer and cancel all buffers. In-flight runs and
    /// their direct continuations complete; queued work stays in the store.
    pub fn stop(&self) {
        self.distributor.stop();
        self.housekeeper.stop();
        self.distributor.deactivate_all();
        self.cron.stop_all();
        info!("engine stopped");
    }

    /// Register a job. A running engine activates an ACTIVE job right away;
    /// activation problems surface as a job status change and a job error
    /// event, not as an error here.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn register_job(&self, job: Job) -> Result<JobId, EngineError> {
        let job_id = self.store.persist_job(job).await?;
        info!(job_id, "job registered");
        if self.distributor.is_running() {
            self.distributor.refresh_job(job_id).await?;
        }
        Ok(job_id)
    }

    /// Replace a job's configuration. Its buffer is rebuilt.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`] and store failures.
    pub async fn update_job(&self, job: Job) -> Result<(), EngineError> {
        let job_id = job.id;
        self.store.update_job(&job).await?;
        self.distributor.refresh_job(job_id).await
    }

    /// Set a job ACTIVE and start dispatching it.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`], store failures, and the activation
    /// errors of the distributor.
    pub async fn activate_job(&self, job_id: JobId) -> Result<(), EngineError> {
        let mut job = self.job(job_id).await?;
        job.status = JobStatus::Active;
        self.store.update_job(&job).await?;
        self.distributor.deactivate(job_id);
        self.distributor.activate(job).await
    }

    /// Set a job INACTIVE and cancel its buffer.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`] and store failures.
    pub async fn deactivate_job(&self, job_id: JobId) -> Result<(), EngineError> {
        let mut job = self.job(job_id).await?;
        job.status = JobStatus::Inactive;
        self.store.update_job(&job).await?;
        self.distributor.deactivate(job_id);
        Ok(())
    }

    /// Stored job.
    ///
    /// # Errors
    ///
    /// [`EngineError::JobNotFound`] and store failures.
    pub async fn job(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Stored execution.
    ///
    /// # Errors
    ///
    /// [`EngineError::ExecutionNotFound`] and store failures.
    pub async fn execution(&self, job_id: JobId, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        self.store
            .get_by_id(job_id, execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound {
                job_id,
                execution_id,
            })
    }

    /// Create an execution. It is picked up by the push path when the store
    /// notifies, otherwise by the next poll.
    ///
    /// # Errors
    ///
    /// See [`ExecutionSubmitter::submit`].
    pub async fn submit(&self, job_id: JobId, request: ExecutionRequest) -> Result<SubmitOutcome, EngineError> {
        self.submitter.submit(job_id, request).await
    }

    /// Create a batch.
    ///
    /// # Errors
    ///
    /// See [`ExecutionSubmitter::submit_batch`].
    pub async fn submit_batch(
        &self,
        job_id: JobId,
        requests: Vec<ExecutionRequest>,
    ) -> Result<SubmittedGroup, EngineError> {
        self.submitter.submit_batch(job_id, requests).await
    }

    /// Create a chain.
    ///
    /// # Errors
    ///
    /// See [`ExecutionSubmitter::submit_chain`].
    pub async fn submit_chain(
        &self,
        job_id: JobId,
        requests: Vec<ExecutionRequest>,
    ) -> Result<SubmittedGroup, EngineError> {
        self.submitter.submit_chain(job_id, requests).await
    }

    /// Abort a QUEUED execution (its whole chain, for chain members).
    ///
    /// # Errors
    ///
    /// See [`ExecutionSubmitter::abort`].
    pub async fn abort_execution(&self, job_id: JobId, execution_id: ExecutionId) -> Result<bool, EngineError> {
        self.submitter.abort(job_id, execution_id).await
    }

    /// Validate and swap the engine configuration. Poll interval, water
    /// marks and housekeeping settings apply from the next tick.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`]; the current configuration is kept.
    pub fn reconfigure(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        *self.config.write() = config;
        info!("engine reconfigured");
        Ok(())
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// View of one job's buffer, if the job is active.
    #[must_use]
    pub fn job_snapshot(&self, job_id: JobId) -> Option<BufferSnapshot> {
        self.buffer.snapshot(job_id)
    }

    /// Whether the job is currently dispatched.
    #[must_use]
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.distributor.is_active(job_id)
    }

    /// Whether the engine is started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.distributor.is_running()
    }

    /// Run one distributor pass now.
    pub async fn poll_now(&self) {
        self.distributor.poll().await;
    }

    /// Run one housekeeping sweep now.
    pub async fn sweep_now(&self) -> HousekeepingReport {
        self.housekeeper.sweep().await
    }

    /// Register an additional event sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.notifier.add_sink(sink);
    }

    /// The engine's bounded in-memory event history.
    #[must_use]
    pub fn history(&self) -> &InMemoryEventSink {
        &self.history
    }

    /// Event fan-out.
    #[must_use]
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Work registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<WorkRegistry> {
        &self.registry
    }

    /// Execution buffer.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<ExecutionBuffer> {
        &self.buffer
    }

    /// Cron trigger.
    #[must_use]
    pub const fn cron(&self) -> &Arc<CronTrigger<S>> {
        &self.cron
    }
}
