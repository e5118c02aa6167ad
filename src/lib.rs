//! # Workhorse
//!
//! An embeddable background-job execution engine.
//!
//! Applications register **jobs** (a kind of work plus its dispatch
//! configuration) and submit **executions** (units of that work). The
//! engine dispatches executions to a bounded pool of concurrent worker loops
//! per job, retries failures, enforces throughput caps, runs chains in strict
//! order, reports batch completion and creates executions from cron
//! schedules.
//!
//! ## Moving parts
//!
//! - **Execution store** ([`core::ExecutionStore`]): durable jobs and
//!   executions. [`infra::InMemoryExecutionStore`] ships for tests and
//!   single-process use.
//! - **Execution buffer** ([`core::ExecutionBuffer`]): per-job in-memory
//!   priority and normal queues, the running set and worker bookkeeping,
//!   each job behind its own lock.
//! - **Distributor** ([`core::Distributor`]): polls the store (and listens
//!   to its push channel) to keep each active job's buffer filled and its
//!   worker loops topped up.
//! - **Worker loop** ([`core::WorkerLoop`]): claims, runs, and applies
//!   retry, chain continuation, throttling and batch checks.
//! - **Cron trigger** ([`core::CronTrigger`]): creates executions on
//!   schedule.
//! - **Notifications** ([`core::Notifier`]): job errors, completions,
//!   retries and group transitions, logged via `tracing` and delivered to
//!   [`core::EventSink`]s.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use workhorse::config::EngineConfig;
//! use workhorse::core::{worker_fn, Engine, ExecutionRequest, Job, WorkContext, WorkRegistry};
//! use workhorse::infra::InMemoryExecutionStore;
//! use workhorse::runtime::TokioSpawner;
//!
//! let registry = Arc::new(WorkRegistry::new());
//! registry.register("send_mail", worker_fn(|params, ctx: WorkContext| async move {
//!     ctx.append_log(format!("sending {params:?}"));
//!     anyhow::Ok(())
//! }));
//!
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryExecutionStore::new()),
//!     registry,
//!     TokioSpawner::current(),
//! )?;
//! let job_id = engine
//!     .register_job(Job::new("mail", "send_mail").with_threads(4).with_retries(3, 1_000))
//!     .await?;
//! engine.start().await;
//! engine
//!     .submit(job_id, ExecutionRequest::with_parameters(json!({"to": "ops@example.com"})))
//!     .await?;
//! ```
//!
//! For complete scenarios, see `tests/engine_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Dispatch core: buffer, distributor, worker loops, cron trigger.
pub mod core;
/// Configuration models for the engine and declared jobs.
pub mod config;
/// Builders to construct an engine from configuration.
pub mod builders;
/// Infrastructure adapters for execution storage backends.
pub mod infra;
/// Runtime adapter and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
