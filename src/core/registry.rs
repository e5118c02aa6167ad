//! Work registry: binds a job's worker reference to invocable work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::core::error::EngineError;
use crate::util::{ExecutionId, JobId};

/// Per-run context handed to a worker.
///
/// Carries identifiers of the running execution and a write-only log
/// side-channel whose text is stored on the execution when it ends.
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Owning job.
    pub job_id: JobId,
    /// Running execution.
    pub execution_id: ExecutionId,
    /// Attempt counter, 0 for the first attempt.
    pub attempt: u32,
    log: Arc<Mutex<String>>,
}

impl WorkContext {
    /// Context for one run.
    #[must_use]
    pub fn new(job_id: JobId, execution_id: ExecutionId, attempt: u32) -> Self {
        Self {
            job_id,
            execution_id,
            attempt,
            log: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Append one line to the execution log.
    pub fn append_log(&self, line: impl AsRef<str>) {
        let mut log = self.log.lock();
        log.push_str(line.as_ref());
        log.push('\n');
    }

    /// Accumulated log text, `None` if nothing was written.
    #[must_use]
    pub fn take_log(&self) -> Option<String> {
        let text = std::mem::take(&mut *self.log.lock());
        (!text.is_empty()).then_some(text)
    }
}

/// Unit of work bound to a worker reference.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use workhorse::core::{JobWorker, WorkContext};
///
/// struct SendMail;
///
/// #[async_trait]
/// impl JobWorker for SendMail {
///     async fn do_work(&self, parameters: Option<serde_json::Value>, ctx: &WorkContext) -> anyhow::Result<()> {
///         ctx.append_log(format!("sending {parameters:?}"));
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobWorker: Send + Sync + 'static {
    /// Run the work for one execution.
    ///
    /// # Errors
    ///
    /// Any error marks the run as failed; the retry policy of the job decides
    /// what happens next.
    async fn do_work(&self, parameters: Option<Value>, ctx: &WorkContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`JobWorker`].
pub struct FnWorker<F> {
    f: F,
}

/// Wrap `f` as a worker.
pub const fn worker_fn<F, Fut>(f: F) -> FnWorker<F>
where
    F: Fn(Option<Value>, WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnWorker { f }
}

#[async_trait]
impl<F, Fut> JobWorker for FnWorker<F>
where
    F: Fn(Option<Value>, WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn do_work(&self, parameters: Option<Value>, ctx: &WorkContext) -> anyhow::Result<()> {
        (self.f)(parameters, ctx.clone()).await
    }
}

/// Outcome of [`WorkRegistry::invoke`].
#[derive(Debug)]
pub enum InvokeError {
    /// No worker is bound to the reference.
    Unbound(String),
    /// The worker ran and returned an error.
    Failed(anyhow::Error),
}

/// Maps worker references to workers.
#[derive(Default)]
pub struct WorkRegistry {
    workers: RwLock<HashMap<String, Arc<dyn JobWorker>>>,
}

impl WorkRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `worker_ref` to `worker`, replacing any previous binding.
    pub fn register(&self, worker_ref: impl Into<String>, worker: impl JobWorker) {
        self.workers.write().insert(worker_ref.into(), Arc::new(worker));
    }

    /// Remove a binding.
    pub fn unregister(&self, worker_ref: &str) -> bool {
        self.workers.write().remove(worker_ref).is_some()
    }

    /// Whether `worker_ref` is bound.
    #[must_use]
    pub fn contains(&self, worker_ref: &str) -> bool {
        self.workers.read().contains_key(worker_ref)
    }

    /// Check that `worker_ref` is bound.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoWorker`] if it is not.
    pub fn ensure_bound(&self, worker_ref: &str) -> Result<(), EngineError> {
        if self.contains(worker_ref) {
            Ok(())
        } else {
            Err(EngineError::NoWorker(worker_ref.to_string()))
        }
    }

    /// Run the worker bound to `worker_ref`.
    ///
    /// # Errors
    ///
    /// [`InvokeError::Unbound`] when nothing is bound, [`InvokeError::Failed`]
    /// when the work itself fails.
    pub async fn invoke(
        &self,
        worker_ref: &str,
        parameters: Option<Value>,
        ctx: &WorkContext,
    ) -> Result<(), InvokeError> {
        let worker = self
            .workers
            .read()
            .get(worker_ref)
            .cloned()
            .ok_or_else(|| InvokeError::Unbound(worker_ref.to_string()))?;
        worker.do_work(parameters, ctx).await.map_err(InvokeError::Failed)
    }
}
