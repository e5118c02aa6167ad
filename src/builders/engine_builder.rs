//! Builders to construct an engine from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::core::{Engine, EngineError, ExecutionStore, Spawn, WorkRegistry};
use crate::infra::InMemoryExecutionStore;

/// Build an engine from configuration and register the jobs it declares.
///
/// Declared jobs whose name already exists in the store are left alone, so
/// restarting against a durable store does not duplicate them.
///
/// # Errors
///
/// [`EngineError::InvalidConfig`] when validation fails, store failures
/// while registering jobs.
pub async fn build_engine<S>(
    cfg: EngineConfig,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<WorkRegistry>,
    spawner: S,
) -> Result<Engine<S>, EngineError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let declared = cfg.jobs.clone();
    let engine = Engine::new(cfg, store, registry, spawner)?;

    let existing: Vec<String> = engine
        .store()
        .get_jobs()
        .await?
        .into_iter()
        .map(|job| job.name)
        .collect();
    for job_cfg in declared {
        if existing.contains(&job_cfg.name) {
            continue;
        }
        let job_id = engine.register_job(job_cfg.to_job()).await?;
        info!(job_id, name = %job_cfg.name, "declared job registered");
    }
    Ok(engine)
}

/// Step-by-step engine construction with in-memory defaults.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ExecutionStore>>,
    registry: Option<Arc<WorkRegistry>>,
}

impl EngineBuilder {
    /// Start from `config`.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            registry: None,
        }
    }

    /// Configuration the engine will be built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Use `store` instead of a fresh [`InMemoryExecutionStore`].
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `registry` instead of an empty one.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<WorkRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build with `spawner`; see [`build_engine`].
    ///
    /// # Errors
    ///
    /// See [`build_engine`].
    pub async fn build<S>(self, spawner: S) -> Result<Engine<S>, EngineError>
    where
        S: Spawn + Clone + Send + Sync + 'static,
    {
        let store = self
            .store
            .unwrap_or_else(|| -> Arc<dyn ExecutionStore> { Arc::new(InMemoryExecutionStore::new()) });
        let registry = self.registry.unwrap_or_default();
        build_engine(self.config, store, registry, spawner).await
    }
}
