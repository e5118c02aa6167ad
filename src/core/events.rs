//! Engine notifications.
//!
//! Components report job errors, completions, retries and group
//! (batch/chain) transitions through a [`Notifier`], which logs every event
//! and fans it out to the registered [`EventSink`]s.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::model::JobStatus;
use crate::util::{BatchId, ChainId, ExecutionId, JobId};

/// Event raised by the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The job hit an engine configuration error and was disabled.
    JobError {
        /// Affected job.
        job_id: JobId,
        /// Status before the transition.
        prior_status: JobStatus,
        /// Human readable cause.
        message: String,
    },
    /// The last worker loop of the job ran out of work.
    JobAllDone {
        /// Affected job.
        job_id: JobId,
        /// Time since the first execution of this run was buffered.
        elapsed_ms: Option<u64>,
    },
    /// An execution completed successfully.
    ExecutionFinished {
        /// Owning job.
        job_id: JobId,
        /// Finished execution.
        execution_id: ExecutionId,
        /// Run time.
        duration_ms: u64,
    },
    /// An execution failed with no retry left.
    ExecutionFailed {
        /// Owning job.
        job_id: JobId,
        /// Failed execution.
        execution_id: ExecutionId,
        /// Error message.
        message: String,
    },
    /// A failed execution was re-queued as a new attempt.
    RetryScheduled {
        /// Owning job.
        job_id: JobId,
        /// Failed attempt.
        execution_id: ExecutionId,
        /// Newly created attempt.
        retry_execution_id: ExecutionId,
        /// Attempt counter of the new attempt.
        attempt: u32,
    },
    /// No member of the batch is queued any more.
    BatchFinished {
        /// Owning job.
        job_id: JobId,
        /// Completed batch.
        batch_id: BatchId,
    },
    /// The last link of a chain finished.
    ChainFinished {
        /// Owning job.
        job_id: JobId,
        /// Completed chain.
        chain_id: ChainId,
    },
    /// A chain link failed permanently and its queued successors were aborted.
    ChainAborted {
        /// Owning job.
        job_id: JobId,
        /// Aborted chain.
        chain_id: ChainId,
        /// Number of links moved to ABORTED.
        aborted: usize,
    },
    /// A RUNNING execution exceeded the maximum running age and was failed.
    ZombieReclassified {
        /// Owning job.
        job_id: JobId,
        /// Reclassified execution.
        execution_id: ExecutionId,
    },
}

impl EngineEvent {
    /// Job the event belongs to.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::JobError { job_id, .. }
            | Self::JobAllDone { job_id, .. }
            | Self::ExecutionFinished { job_id, .. }
            | Self::ExecutionFailed { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::BatchFinished { job_id, .. }
            | Self::ChainFinished { job_id, .. }
            | Self::ChainAborted { job_id, .. }
            | Self::ZombieReclassified { job_id, .. } => *job_id,
        }
    }
}

/// Receiver of engine events.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &EngineEvent);
}

/// Bounded in-memory history, for tests and administrative views.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<EngineEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Keep at most `max_events`, dropping the oldest first.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events matching `pred`.
    pub fn matching(&self, pred: impl Fn(&EngineEvent) -> bool) -> Vec<EngineEvent> {
        self.events.lock().iter().filter(|e| pred(e)).cloned().collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: &EngineEvent) {
        let mut events = self.events.lock();
        if self.max_events == 0 {
            return;
        }
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Forwards events over a crossbeam channel to a consumer on any thread.
pub struct ChannelEventSink {
    tx: crossbeam_channel::Sender<EngineEvent>,
}

impl ChannelEventSink {
    /// Unbounded sink and its receiving end.
    #[must_use]
    pub fn unbounded() -> (Self, crossbeam_channel::Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Bounded sink; events are dropped while the consumer lags.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, crossbeam_channel::Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn record(&self, event: &EngineEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) | Err(crossbeam_channel::TrySendError::Disconnected(_)) => {}
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                warn!(job_id = event.job_id(), "event channel full, dropping event");
            }
        }
    }
}

/// Logs events and fans them out to sinks.
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl Notifier {
    /// Notifier with no sinks; events are only logged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Log `event` and deliver it to every sink.
    pub fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::JobError {
                job_id,
                prior_status,
                message,
            } => error!(job_id, ?prior_status, message = %message, "job error"),
            EngineEvent::ExecutionFailed {
                job_id,
                execution_id,
                message,
            } => warn!(job_id, execution_id, message = %message, "execution failed"),
            EngineEvent::ZombieReclassified {
                job_id,
                execution_id,
            } => warn!(job_id, execution_id, "zombie execution reclassified as failed"),
            EngineEvent::ChainAborted {
                job_id,
                chain_id,
                aborted,
            } => warn!(job_id, %chain_id, aborted, "chain aborted"),
            other => info!(job_id = other.job_id(), event = ?other, "engine event"),
        }
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.record(&event);
        }
    }
}
