//! Tests for builder modules

use std::sync::Arc;

use workhorse::builders::{build_engine, EngineBuilder};
use workhorse::config::{EngineConfig, JobConfig};
use workhorse::core::{ExecutionStore, JobStatus, WorkRegistry};
use workhorse::infra::InMemoryExecutionStore;
use workhorse::runtime::TokioSpawner;

fn config_with_jobs() -> EngineConfig {
    EngineConfig {
        jobs: vec![
            JobConfig {
                name: "mail".to_string(),
                worker_ref: "send_mail".to_string(),
                threads: 2,
                ..JobConfig::default()
            },
            JobConfig {
                name: "reports".to_string(),
                worker_ref: "build_report".to_string(),
                status: JobStatus::Inactive,
                ..JobConfig::default()
            },
        ],
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_build_engine_registers_declared_jobs_once() {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let registry = Arc::new(WorkRegistry::new());

    build_engine(config_with_jobs(), Arc::clone(&store), Arc::clone(&registry), TokioSpawner::current())
        .await
        .unwrap();
    build_engine(config_with_jobs(), Arc::clone(&store), registry, TokioSpawner::current())
        .await
        .unwrap();

    let mut jobs = store.get_jobs().await.unwrap();
    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].name, "mail");
    assert_eq!(jobs[0].threads, 2);
    assert_eq!(jobs[1].status, JobStatus::Inactive);
}

#[tokio::test]
async fn test_engine_builder_defaults() {
    let builder = EngineBuilder::new(config_with_jobs());
    assert_eq!(builder.config().jobs.len(), 2);

    let engine = builder.build(TokioSpawner::current()).await.unwrap();
    assert_eq!(engine.store().get_jobs().await.unwrap().len(), 2);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_engine_builder_rejects_invalid_config() {
    let cfg = EngineConfig {
        poll_interval_ms: 0,
        ..EngineConfig::default()
    };
    assert!(EngineBuilder::new(cfg).build(TokioSpawner::current()).await.is_err());
}
