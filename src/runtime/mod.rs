//! Runtime adapter and API surface.

pub mod api;
pub mod tokio_spawner;

pub use api::{
    execution_status, health, list_jobs, submit_execution, ExecutionStatusResponse,
    ExecutionSubmission, Health, JobSnapshot,
};
pub use tokio_spawner::TokioSpawner;
