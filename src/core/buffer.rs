//! Per-job in-memory execution buffer.
//!
//! Each active job owns one [`JobBufferState`] behind its own
//! `parking_lot::Mutex`: a priority queue and a normal queue of execution ids,
//! the set of ids currently running, the registered worker loops and the
//! concurrency counters. The buffer knows nothing about persistence or
//! scheduling.
//!
//! Invariant: an execution id is in at most one of {priority queue, normal
//! queue, running set} of its job at any instant. Every mutation that could
//! break it checks and mutates under the same lock acquisition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::error::EngineError;
use crate::core::spawn::StopToken;
use crate::util::{ExecutionId, JobId, WorkerId};

/// Handle of one worker loop registered with a job's buffer.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Buffer-assigned id.
    pub id: WorkerId,
    /// Set by [`ExecutionBuffer::cancel`]; checked before each claim.
    pub stop: StopToken,
}

/// What a worker loop gets when it asks for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Run this execution; it is already in the running set.
    Execution(ExecutionId),
    /// Nothing left; the worker has been deregistered.
    Retire(Retirement),
}

/// Outcome of deregistering a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retirement {
    /// This was the job's last registered worker.
    pub last: bool,
    /// Time since the first execution of this run was buffered, reported
    /// with the last retirement only.
    pub elapsed: Option<Duration>,
}

/// Point-in-time view of one job's buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Ids in the priority queue, head first.
    pub priority_queue: Vec<ExecutionId>,
    /// Ids in the normal queue, head first.
    pub normal_queue: Vec<ExecutionId>,
    /// Ids currently running, sorted.
    pub running: Vec<ExecutionId>,
    /// Registered worker loops.
    pub workers: usize,
    /// Target number of worker loops.
    pub desired_concurrency: usize,
    /// Worker loops currently counted as running.
    pub running_concurrency: usize,
}

#[derive(Debug, Default)]
struct JobBufferState {
    normal_queue: VecDeque<ExecutionId>,
    priority_queue: VecDeque<ExecutionId>,
    running: HashSet<ExecutionId>,
    workers: HashMap<WorkerId, StopToken>,
    desired_concurrency: usize,
    running_concurrency: usize,
    first_dispatch: Option<Instant>,
}

impl JobBufferState {
    fn with_desired(desired_concurrency: usize) -> Self {
        Self {
            desired_concurrency,
            ..Self::default()
        }
    }

    fn contains(&self, id: ExecutionId) -> bool {
        self.running.contains(&id) || self.priority_queue.contains(&id) || self.normal_queue.contains(&id)
    }

    fn pop(&mut self) -> Option<ExecutionId> {
        self.priority_queue
            .pop_front()
            .or_else(|| self.normal_queue.pop_front())
    }

    fn deregister(&mut self, worker_id: WorkerId) -> Retirement {
        if self.workers.remove(&worker_id).is_none() {
            // Already dropped by a cancel; counters were reset there.
            return Retirement::default();
        }
        self.running_concurrency = self.running_concurrency.saturating_sub(1);
        if self.running_concurrency > 0 {
            return Retirement::default();
        }
        Retirement {
            last: true,
            elapsed: self.first_dispatch.take().map(|t| t.elapsed()),
        }
    }

    fn cancel(&mut self) {
        self.normal_queue.clear();
        self.priority_queue.clear();
        for stop in self.workers.values() {
            stop.stop();
        }
        self.workers.clear();
        self.running_concurrency = 0;
        self.first_dispatch = None;
    }

    fn snapshot(&self) -> BufferSnapshot {
        let mut running: Vec<_> = self.running.iter().copied().collect();
        running.sort_unstable();
        BufferSnapshot {
            priority_queue: self.priority_queue.iter().copied().collect(),
            normal_queue: self.normal_queue.iter().copied().collect(),
            running,
            workers: self.workers.len(),
            desired_concurrency: self.desired_concurrency,
            running_concurrency: self.running_concurrency,
        }
    }
}

/// Registry of per-job buffer states.
///
/// Operations on a job without buffer state are configuration errors: they
/// are logged and behave as no-ops so dispatch loops keep running.
#[derive(Default)]
pub struct ExecutionBuffer {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobBufferState>>>>,
    next_worker_id: AtomicU64,
}

impl ExecutionBuffer {
    /// Empty buffer registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, job_id: JobId, op: &'static str) -> Option<Arc<Mutex<JobBufferState>>> {
        let state = self.jobs.read().get(&job_id).cloned();
        if state.is_none() {
            error!(job_id, op, "no buffer state for job");
        }
        state
    }

    /// Create fresh state for a job. Existing state is cancelled and replaced.
    pub fn init_job(&self, job_id: JobId, desired_concurrency: usize) {
        let fresh = Arc::new(Mutex::new(JobBufferState::with_desired(desired_concurrency)));
        if let Some(old) = self.jobs.write().insert(job_id, fresh) {
            old.lock().cancel();
        }
        debug!(job_id, desired_concurrency, "buffer initialized");
    }

    /// Cancel and drop a job's state. Returns whether state existed.
    pub fn remove_job(&self, job_id: JobId) -> bool {
        let removed = self.jobs.write().remove(&job_id);
        removed.is_some_and(|state| {
            state.lock().cancel();
            true
        })
    }

    /// Whether the job has buffer state.
    #[must_use]
    pub fn contains_job(&self, job_id: JobId) -> bool {
        self.jobs.read().contains_key(&job_id)
    }

    /// Jobs with buffer state.
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.read().keys().copied().collect()
    }

    /// False if the id is already queued or running for the job.
    #[must_use]
    pub fn is_addable(&self, job_id: JobId, id: ExecutionId) -> bool {
        self.state(job_id, "is_addable")
            .is_some_and(|state| !state.lock().contains(id))
    }

    /// Queue an id unless it is already queued or running. Returns whether it
    /// was added; the first id buffered since the job went idle starts the
    /// dispatch clock.
    pub fn enqueue(&self, job_id: JobId, id: ExecutionId, priority: bool) -> bool {
        let Some(state) = self.state(job_id, "enqueue") else {
            return false;
        };
        let mut state = state.lock();
        if state.contains(id) {
            return false;
        }
        if priority {
            state.priority_queue.push_back(id);
        } else {
            state.normal_queue.push_back(id);
        }
        state.first_dispatch.get_or_insert_with(Instant::now);
        true
    }

    /// Pop the next id, priority queue first.
    pub fn claim_next(&self, job_id: JobId) -> Option<ExecutionId> {
        self.state(job_id, "claim_next")?.lock().pop()
    }

    /// Pop the next id and mark it running, or deregister the worker when
    /// both queues are empty, in one lock acquisition.
    pub fn claim_for_worker(&self, job_id: JobId, worker_id: WorkerId) -> Claim {
        let Some(state) = self.state(job_id, "claim_for_worker") else {
            return Claim::Retire(Retirement::default());
        };
        let mut state = state.lock();
        match state.pop() {
            Some(id) => {
                state.running.insert(id);
                Claim::Execution(id)
            }
            None => Claim::Retire(state.deregister(worker_id)),
        }
    }

    /// Add to the running set. Does nothing if the id is queued.
    pub fn mark_running(&self, job_id: JobId, id: ExecutionId) -> bool {
        let Some(state) = self.state(job_id, "mark_running") else {
            return false;
        };
        let mut state = state.lock();
        if state.priority_queue.contains(&id) || state.normal_queue.contains(&id) {
            return false;
        }
        state.running.insert(id)
    }

    /// Take ownership of an execution a worker runs without claiming it
    /// (retries, chain links): pull it out of either queue and mark it
    /// running. False if it is already running elsewhere. Without buffer
    /// state nothing else can dispatch it, so ownership is granted.
    pub fn take_for_run(&self, job_id: JobId, id: ExecutionId) -> bool {
        let Some(state) = self.jobs.read().get(&job_id).cloned() else {
            return true;
        };
        let mut state = state.lock();
        state.priority_queue.retain(|queued| *queued != id);
        state.normal_queue.retain(|queued| *queued != id);
        state.running.insert(id)
    }

    /// Remove from the running set.
    pub fn unmark_running(&self, job_id: JobId, id: ExecutionId) -> bool {
        // Quiet on missing state: in-flight runs outlive a deactivated job.
        self.jobs
            .read()
            .get(&job_id)
            .is_some_and(|state| state.lock().running.remove(&id))
    }

    /// Queued plus running ids.
    #[must_use]
    pub fn occupancy(&self, job_id: JobId) -> usize {
        self.state(job_id, "occupancy").map_or(0, |state| {
            let state = state.lock();
            state.priority_queue.len() + state.normal_queue.len() + state.running.len()
        })
    }

    /// Clear both queues and ask every registered worker to stop after its
    /// current execution. Resets the running-worker count to zero.
    pub fn cancel(&self, job_id: JobId) {
        if let Some(state) = self.state(job_id, "cancel") {
            state.lock().cancel();
        }
    }

    /// Register a worker loop unconditionally.
    pub fn register_worker(&self, job_id: JobId) -> Option<WorkerHandle> {
        let state = self.state(job_id, "register_worker")?;
        let mut state = state.lock();
        Some(self.register_locked(&mut state))
    }

    /// Register a worker loop if fewer than the desired number are running.
    ///
    /// # Errors
    ///
    /// [`EngineError::BufferMissing`] when the job has no buffer state, e.g.
    /// because it was deactivated concurrently.
    pub fn reserve_worker(&self, job_id: JobId) -> Result<Option<WorkerHandle>, EngineError> {
        let state = self
            .jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::BufferMissing(job_id))?;
        let mut state = state.lock();
        if state.running_concurrency >= state.desired_concurrency {
            return Ok(None);
        }
        Ok(Some(self.register_locked(&mut state)))
    }

    fn register_locked(&self, state: &mut JobBufferState) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let stop = StopToken::new();
        state.workers.insert(id, stop.clone());
        state.running_concurrency += 1;
        WorkerHandle { id, stop }
    }

    /// Deregister a worker loop.
    pub fn deregister_worker(&self, job_id: JobId, worker_id: WorkerId) -> Retirement {
        self.jobs
            .read()
            .get(&job_id)
            .map_or_else(Retirement::default, |state| state.lock().deregister(worker_id))
    }

    /// Registered worker loops.
    #[must_use]
    pub fn worker_count(&self, job_id: JobId) -> usize {
        self.state(job_id, "worker_count")
            .map_or(0, |state| state.lock().workers.len())
    }

    /// Worker loops counted as running.
    #[must_use]
    pub fn running_concurrency(&self, job_id: JobId) -> usize {
        self.state(job_id, "running_concurrency")
            .map_or(0, |state| state.lock().running_concurrency)
    }

    /// Change the target number of worker loops. Extra running loops are not
    /// stopped; they retire when they run out of work.
    pub fn set_desired_concurrency(&self, job_id: JobId, desired: usize) {
        if let Some(state) = self.state(job_id, "set_desired_concurrency") {
            state.lock().desired_concurrency = desired;
        }
    }

    /// View of one job's buffer.
    #[must_use]
    pub fn snapshot(&self, job_id: JobId) -> Option<BufferSnapshot> {
        self.jobs.read().get(&job_id).map(|state| state.lock().snapshot())
    }
}
