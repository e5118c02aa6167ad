//! Tests for the tokio spawner and the API surface

use std::sync::Arc;

use serde_json::{json, Value};
use workhorse::config::EngineConfig;
use workhorse::core::{worker_fn, Engine, ExecutionStatus, Job, JobStatus, Spawn, WorkContext, WorkRegistry};
use workhorse::infra::InMemoryExecutionStore;
use workhorse::runtime::{api, execution_status, health, list_jobs, submit_execution, TokioSpawner};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::current();

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_try_current_outside_runtime() {
    assert!(TokioSpawner::try_current().is_err());
}

#[test]
fn test_owned_runtime_spawner() {
    let spawner = TokioSpawner::with_worker_threads(1).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    spawner.spawn(async move {
        tx.send("done").unwrap();
    });
    assert_eq!(rx.recv().unwrap(), "done");
}

fn idle_engine() -> Engine {
    let registry = Arc::new(WorkRegistry::new());
    registry.register(
        "noop",
        worker_fn(|_params: Option<Value>, _ctx: WorkContext| async { anyhow::Ok(()) }),
    );
    Engine::new(
        EngineConfig::default(),
        Arc::new(InMemoryExecutionStore::new()),
        registry,
        TokioSpawner::current(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_api_submit_and_status() {
    let engine = idle_engine();
    let job_id = engine
        .register_job(Job::new("api", "noop").with_status(JobStatus::Inactive))
        .await
        .unwrap();

    let body = json!({"job_id": job_id, "parameters": {"x": 1}, "priority": true}).to_string();
    let submission = api::parse_submission(&body).unwrap();
    assert!(submission.request.priority);

    let submitted = submit_execution(&engine, submission).await.unwrap();
    assert!(submitted.created);
    assert_eq!(submitted.status, ExecutionStatus::Queued);

    let status = execution_status(&engine, job_id, submitted.execution_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Queued);
    assert_eq!(status.attempt, 0);
    assert_eq!(api::to_json(&status)["status"], "QUEUED");

    assert!(execution_status(&engine, job_id, 9_999).await.is_err());
    assert!(api::parse_submission("{").is_err());
}

#[tokio::test]
async fn test_api_health_and_listing() {
    let engine = idle_engine();
    let job_id = engine.register_job(Job::new("listed", "noop")).await.unwrap();

    let before = health(&engine);
    assert!(before.ok);
    assert!(!before.running);
    assert_eq!(before.active_jobs, 0);

    engine.start().await;
    let after = health(&engine);
    assert!(after.running);
    assert_eq!(after.active_jobs, 1);

    let jobs = list_jobs(&engine).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job_id);
    assert_eq!(jobs[0].buffer.as_ref().map(|b| b.desired_concurrency), Some(1));
    engine.stop();
}
