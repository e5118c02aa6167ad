//! Jobs, executions and their lifecycle states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::util::{BatchId, ChainId, ExecutionId, JobId};

/// Administrative state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Executions are dispatched.
    Active,
    /// Registered but not dispatched.
    Inactive,
    /// Disabled after an engine configuration error.
    Error,
    /// The worker reference has no binding in the work registry.
    NoWorker,
}

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Waiting to be dispatched.
    Queued,
    /// Claimed by a worker loop.
    Running,
    /// Work completed without error.
    Finished,
    /// Work raised an error and no further retry applies.
    Failed,
    /// Cancelled before it ran.
    Aborted,
}

impl ExecutionStatus {
    /// Terminal states never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }
}

/// A registered kind of work plus its dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier (0 until persisted).
    pub id: JobId,
    /// Human readable name.
    pub name: String,
    /// Optional free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Key into the work registry.
    pub worker_ref: String,
    /// Administrative state.
    pub status: JobStatus,
    /// Cron expression; `None` or blank means unscheduled.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Desired number of concurrent worker loops.
    pub threads: usize,
    /// Throughput cap per worker slot.
    #[serde(default)]
    pub max_per_minute: Option<u32>,
    /// Maximum retry attempts for a failing execution.
    #[serde(default)]
    pub fail_retries: u32,
    /// Pause before a retry attempt, in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Reject new executions whose parameters match a queued one.
    #[serde(default)]
    pub unique_in_queue: bool,
    /// Retention of terminal executions, in days.
    #[serde(default)]
    pub days_until_clean_up: Option<u32>,
    /// Default payload for cron-triggered executions.
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl Job {
    /// New active job with one thread and no retries.
    pub fn new(name: impl Into<String>, worker_ref: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            worker_ref: worker_ref.into(),
            status: JobStatus::Active,
            schedule: None,
            threads: 1,
            max_per_minute: None,
            fail_retries: 0,
            retry_delay_ms: 0,
            unique_in_queue: false,
            days_until_clean_up: None,
            parameters: None,
        }
    }

    /// Set the desired concurrency.
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retries(mut self, fail_retries: u32, retry_delay_ms: u64) -> Self {
        self.fail_retries = fail_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set the throughput cap.
    #[must_use]
    pub const fn with_max_per_minute(mut self, max_per_minute: u32) -> Self {
        self.max_per_minute = Some(max_per_minute);
        self
    }

    /// Set the cron schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Enable parameter-hash deduplication of queued executions.
    #[must_use]
    pub const fn with_unique_in_queue(mut self, unique: bool) -> Self {
        self.unique_in_queue = unique;
        self
    }

    /// Set the administrative state.
    #[must_use]
    pub const fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Non-blank cron expression, if any.
    #[must_use]
    pub fn cron_expression(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Minimum spacing between execution starts of one worker slot.
    #[must_use]
    pub fn min_spacing(&self) -> Option<Duration> {
        match self.max_per_minute {
            Some(n) if n > 0 => Some(Duration::from_millis(60_000 / u64::from(n))),
            _ => None,
        }
    }

    /// Pause before a retry attempt.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One unit of queued or running work belonging to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Store-assigned identifier (0 until persisted).
    pub id: ExecutionId,
    /// Owning job.
    pub job_id: JobId,
    /// Lifecycle state.
    pub status: ExecutionStatus,
    /// Opaque payload handed to the worker.
    pub parameters: Option<Value>,
    /// Hex SHA-256 of the payload (JSON `null` when absent), used for queue
    /// deduplication.
    pub parameters_hash: Option<String>,
    /// Dispatch before normal executions.
    pub priority: bool,
    /// Not-before timestamp.
    pub maturity: Option<DateTime<Utc>>,
    /// Batch grouping.
    pub batch_id: Option<BatchId>,
    /// Chain grouping.
    pub chain_id: Option<ChainId>,
    /// Predecessor link; set on every chain member except the head.
    pub chained_previous_execution_id: Option<ExecutionId>,
    /// Successor link.
    pub chained_next_execution_id: Option<ExecutionId>,
    /// Attempt counter, 0 for the first attempt.
    pub fail_retry: u32,
    /// First attempt this execution retries.
    pub fail_retry_execution_id: Option<ExecutionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the run.
    pub started_at: Option<DateTime<Utc>>,
    /// End of the run.
    pub ended_at: Option<DateTime<Utc>>,
    /// Run time in milliseconds.
    pub duration_ms: Option<u64>,
    /// Top-level error message of a failed run.
    pub fail_message: Option<String>,
    /// Full error chain of a failed run.
    pub fail_stacktrace: Option<String>,
    /// Log text appended by the worker during the run.
    pub log: Option<String>,
}

impl Execution {
    /// New queued execution for `job_id`.
    pub fn new(job_id: JobId, parameters: Option<Value>) -> Self {
        let parameters_hash = Some(parameters_hash(parameters.as_ref().unwrap_or(&Value::Null)));
        Self {
            id: 0,
            job_id,
            status: ExecutionStatus::Queued,
            parameters,
            parameters_hash,
            priority: false,
            maturity: None,
            batch_id: None,
            chain_id: None,
            chained_previous_execution_id: None,
            chained_next_execution_id: None,
            fail_retry: 0,
            fail_retry_execution_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            fail_message: None,
            fail_stacktrace: None,
            log: None,
        }
    }

    /// Mark as priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Defer dispatch until `maturity`.
    #[must_use]
    pub const fn with_maturity(mut self, maturity: DateTime<Utc>) -> Self {
        self.maturity = Some(maturity);
        self
    }

    /// True when `maturity` is unset or not after `now`.
    #[must_use]
    pub fn is_mature(&self, now: DateTime<Utc>) -> bool {
        self.maturity.is_none_or(|m| m <= now)
    }

    /// Chain members other than the head are fetched by the worker loop,
    /// never through the buffer.
    #[must_use]
    pub const fn is_chain_continuation(&self) -> bool {
        self.chained_previous_execution_id.is_some()
    }

    /// Id that successor links refer to. A retry stands in for the attempt
    /// it retries.
    #[must_use]
    pub fn chain_anchor_id(&self) -> ExecutionId {
        self.fail_retry_execution_id.unwrap_or(self.id)
    }

    /// Queued clone of a failed attempt with the attempt counter advanced.
    #[must_use]
    pub fn to_retry(&self) -> Self {
        Self {
            id: 0,
            job_id: self.job_id,
            status: ExecutionStatus::Queued,
            parameters: self.parameters.clone(),
            parameters_hash: self.parameters_hash.clone(),
            priority: self.priority,
            maturity: self.maturity,
            batch_id: self.batch_id,
            chain_id: self.chain_id,
            chained_previous_execution_id: self.chained_previous_execution_id,
            chained_next_execution_id: self.chained_next_execution_id,
            fail_retry: self.fail_retry + 1,
            fail_retry_execution_id: Some(self.chain_anchor_id()),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            fail_message: None,
            fail_stacktrace: None,
            log: None,
        }
    }
}

/// Hex SHA-256 of a payload's canonical JSON text.
#[must_use]
pub fn parameters_hash(parameters: &Value) -> String {
    format!("{:x}", Sha256::digest(parameters.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_payloads_hash_equal() {
        let a = Execution::new(1, Some(json!({"b": 2, "a": 1})));
        let b = Execution::new(1, Some(json!({"a": 1, "b": 2})));
        assert_eq!(a.parameters_hash, b.parameters_hash);
        assert_eq!(a.parameters_hash.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn retry_links_back_to_first_attempt() {
        let mut first = Execution::new(1, Some(json!("x"))).with_priority(true);
        first.id = 10;
        let second = first.to_retry();
        assert_eq!(second.fail_retry, 1);
        assert_eq!(second.fail_retry_execution_id, Some(10));
        assert!(second.priority);

        let mut second = second;
        second.id = 11;
        let third = second.to_retry();
        assert_eq!(third.fail_retry, 2);
        assert_eq!(third.fail_retry_execution_id, Some(10));
        assert_eq!(third.chain_anchor_id(), 10);
    }

    #[test]
    fn min_spacing_from_max_per_minute() {
        let job = Job::new("j", "w").with_max_per_minute(60);
        assert_eq!(job.min_spacing(), Some(Duration::from_millis(1000)));
        assert_eq!(Job::new("j", "w").min_spacing(), None);
    }

    #[test]
    fn blank_schedule_is_unscheduled() {
        assert_eq!(Job::new("j", "w").with_schedule("  ").cron_expression(), None);
        assert_eq!(
            Job::new("j", "w").with_schedule("0 * * * * *").cron_expression(),
            Some("0 * * * * *")
        );
    }

    #[test]
    fn maturity_gate() {
        let now = Utc::now();
        let exec = Execution::new(1, None).with_maturity(now + chrono::Duration::seconds(30));
        assert!(!exec.is_mature(now));
        assert!(exec.is_mature(now + chrono::Duration::seconds(31)));
        assert!(Execution::new(1, None).is_mature(now));
    }
}
