//! Engine and job configuration structures.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::model::{Job, JobStatus};

/// Configuration shared by the running components. Swapped as a whole by
/// `Engine::reconfigure`; readers copy what they need per tick.
pub type SharedConfig = Arc<RwLock<EngineConfig>>;

/// A job declared in configuration and registered at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job name.
    pub name: String,
    /// Key into the work registry.
    pub worker_ref: String,
    /// Optional description.
    pub description: Option<String>,
    /// Initial status.
    pub status: JobStatus,
    /// Cron expression.
    pub schedule: Option<String>,
    /// Desired concurrency.
    pub threads: usize,
    /// Throughput cap per worker slot.
    pub max_per_minute: Option<u32>,
    /// Maximum retry attempts.
    pub fail_retries: u32,
    /// Pause before a retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Deduplicate queued executions by parameter hash.
    pub unique_in_queue: bool,
    /// Retention of terminal executions, in days.
    pub days_until_clean_up: Option<u32>,
    /// Default payload for cron-triggered executions.
    pub parameters: Option<Value>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            worker_ref: String::new(),
            description: None,
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
}

impl JobConfig {
    /// Validate job configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.worker_ref.trim().is_empty() {
            return Err("worker_ref must not be empty".into());
        }
        if self.max_per_minute == Some(0) {
            return Err("max_per_minute must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Unpersisted job carrying this configuration.
    #[must_use]
    pub fn to_job(&self) -> Job {
        Job {
            id: 0,
            name: self.name.clone(),
            description: self.description.clone(),
            worker_ref: self.worker_ref.clone(),
            status: self.status,
            schedule: self.schedule.clone(),
            threads: self.threads,
            max_per_minute: self.max_per_minute,
            fail_retries: self.fail_retries,
            retry_delay_ms: self.retry_delay_ms,
            unique_in_queue: self.unique_in_queue,
            days_until_clean_up: self.days_until_clean_up,
            parameters: self.parameters.clone(),
        }
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between distributor polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// A job's buffer is refilled once its occupancy drops below this.
    pub buffer_low_water: usize,
    /// Maximum number of executions fetched per refill.
    pub buffer_high_water: usize,
    /// RUNNING executions older than this are failed by the housekeeper.
    /// Unset disables zombie detection.
    pub zombie_max_age_secs: Option<u64>,
    /// Interval between housekeeping sweeps, in seconds.
    pub housekeeping_interval_secs: u64,
    /// Capacity of the engine's in-memory event history.
    pub event_history: usize,
    /// Worker threads of a runtime created by the engine builder.
    pub runtime_worker_threads: usize,
    /// Jobs registered by the builder.
    pub jobs: Vec<JobConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            buffer_low_water: 10,
            buffer_high_water: 50,
            zombie_max_age_secs: None,
            housekeeping_interval_secs: 60,
            event_history: 1_000,
            runtime_worker_threads: num_cpus::get(),
            jobs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Validate all values, including declared jobs.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.buffer_low_water == 0 {
            return Err("buffer_low_water must be greater than 0".into());
        }
        if self.buffer_high_water < self.buffer_low_water {
            return Err("buffer_high_water must not be below buffer_low_water".into());
        }
        if self.zombie_max_age_secs == Some(0) {
            return Err("zombie_max_age_secs must be greater than 0 when set".into());
        }
        if self.housekeeping_interval_secs == 0 {
            return Err("housekeeping_interval_secs must be greater than 0".into());
        }
        if self.runtime_worker_threads == 0 {
            return Err("runtime_worker_threads must be greater than 0".into());
        }
        for job in &self.jobs {
            job.validate()
                .map_err(|e| format!("job `{}` invalid: {e}", job.name))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the environment, loading `.env` first.
    ///
    /// `WORKHORSE_CONFIG` names a JSON file used as the base; the scalar
    /// `WORKHORSE_*` variables (`POLL_INTERVAL_MS`, `BUFFER_LOW_WATER`,
    /// `BUFFER_HIGH_WATER`, `ZOMBIE_MAX_AGE_SECS`,
    /// `HOUSEKEEPING_INTERVAL_SECS`, `EVENT_HISTORY`,
    /// `RUNTIME_WORKER_THREADS`) override it.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();

        let mut cfg = match std::env::var("WORKHORSE_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| format!("cannot read `{path}`: {e}"))?;
                serde_json::from_str(&text).map_err(|e| format!("parse error in `{path}`: {e}"))?
            }
            Err(_) => Self::default(),
        };

        if let Some(v) = env_var("WORKHORSE_POLL_INTERVAL_MS")? {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = env_var("WORKHORSE_BUFFER_LOW_WATER")? {
            cfg.buffer_low_water = v;
        }
        if let Some(v) = env_var("WORKHORSE_BUFFER_HIGH_WATER")? {
            cfg.buffer_high_water = v;
        }
        if let Some(v) = env_var("WORKHORSE_ZOMBIE_MAX_AGE_SECS")? {
            cfg.zombie_max_age_secs = Some(v);
        }
        if let Some(v) = env_var("WORKHORSE_HOUSEKEEPING_INTERVAL_SECS")? {
            cfg.housekeeping_interval_secs = v;
        }
        if let Some(v) = env_var("WORKHORSE_EVENT_HISTORY")? {
            cfg.event_history = v;
        }
        if let Some(v) = env_var("WORKHORSE_RUNTIME_WORKER_THREADS")? {
            cfg.runtime_worker_threads = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Distributor poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Housekeeping interval.
    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    /// Maximum running age before an execution counts as a zombie.
    #[must_use]
    pub fn zombie_max_age(&self) -> Option<Duration> {
        self.zombie_max_age_secs.map(Duration::from_secs)
    }

    /// Wrap into a [`SharedConfig`].
    #[must_use]
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{name}: {e}")),
        Err(_) => Ok(None),
    }
}
