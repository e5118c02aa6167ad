//! Dispatch core: buffer, distributor, worker loops, cron trigger and the
//! seams they share.

pub mod buffer;
pub mod cron_trigger;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod events;
pub mod housekeeping;
pub mod model;
pub mod registry;
pub mod spawn;
pub mod store;
pub mod submitter;
pub mod worker_loop;

pub use buffer::{BufferSnapshot, Claim, ExecutionBuffer, Retirement, WorkerHandle};
pub use cron_trigger::{CronSchedule, CronTrigger};
pub use distributor::Distributor;
pub use engine::Engine;
pub use error::{AppResult, EngineError, StoreError};
pub use events::{ChannelEventSink, EngineEvent, EventSink, InMemoryEventSink, Notifier};
pub use housekeeping::{Housekeeper, HousekeepingReport};
pub use model::{parameters_hash, Execution, ExecutionStatus, Job, JobStatus};
pub use registry::{worker_fn, FnWorker, InvokeError, JobWorker, WorkContext, WorkRegistry};
pub use spawn::{Spawn, StopToken};
pub use store::{ExecutionStore, StoreResult};
pub use submitter::{ExecutionRequest, ExecutionSubmitter, SubmitOutcome, SubmittedGroup};
pub use worker_loop::WorkerLoop;
