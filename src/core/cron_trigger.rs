//! Cron-driven creation of executions.
//!
//! Each scheduled job gets one timer task. The next fire time is recomputed
//! from the expression after every fire, so irregular cadences ("at 9:00 and
//! 17:30", "last weekday of the month") are honoured exactly.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::distributor::disable_job;
use crate::core::error::EngineError;
use crate::core::events::Notifier;
use crate::core::model::{Job, JobStatus};
use crate::core::spawn::{Spawn, StopToken};
use crate::core::store::ExecutionStore;
use crate::core::submitter::{ExecutionRequest, ExecutionSubmitter};
use crate::util::{now, until, JobId};

/// Parsed cron expression.
///
/// Accepts the `cron` crate's six/seven field form (seconds first) and the
/// classic five field form, which fires at second zero.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse `expression`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidSchedule`] with the parser's message.
    pub fn parse(expression: &str) -> Result<Self, EngineError> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| EngineError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// First fire time strictly after `after`.
    #[must_use]
    pub fn next_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Expression as given (trimmed).
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Owns the timers of all scheduled jobs.
pub struct CronTrigger<S> {
    store: Arc<dyn ExecutionStore>,
    submitter: Arc<ExecutionSubmitter>,
    notifier: Notifier,
    spawner: S,
    timers: Mutex<HashMap<JobId, StopToken>>,
}

impl<S> CronTrigger<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Trigger with no armed timers.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        submitter: Arc<ExecutionSubmitter>,
        notifier: Notifier,
        spawner: S,
    ) -> Self {
        Self {
            store,
            submitter,
            notifier,
            spawner,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Arm every ACTIVE job with a schedule. Returns how many were armed;
    /// jobs with invalid expressions are disabled and skipped.
    ///
    /// # Errors
    ///
    /// Store failures while listing jobs.
    pub async fn start(&self) -> Result<usize, EngineError> {
        let mut armed = 0;
        for job in self.store.get_jobs().await? {
            if job.status != JobStatus::Active {
                continue;
            }
            match self.start_job(&job).await {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = job.id, error = %e, "job not scheduled"),
            }
        }
        info!(armed, "cron trigger started");
        Ok(armed)
    }

    /// (Re-)arm one job's timer. Any previous timer of the job is stopped.
    /// Returns false when the job has no schedule.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidSchedule`]; the job is set to ERROR and a job
    /// error event is raised before returning.
    pub async fn start_job(&self, job: &Job) -> Result<bool, EngineError> {
        let Some(expression) = job.cron_expression() else {
            self.stop_job(job.id);
            return Ok(false);
        };
        let schedule = match CronSchedule::parse(expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                self.stop_job(job.id);
                disable_job(&*self.store, &self.notifier, job.id, JobStatus::Error, e.to_string()).await;
                return Err(e);
            }
        };

        let stop = StopToken::new();
        if let Some(previous) = self.timers.lock().insert(job.id, stop.clone()) {
            previous.stop();
        }
        debug!(job_id = job.id, schedule = schedule.expression(), "cron timer armed");
        self.spawner.spawn(run_timer(
            Arc::clone(&self.submitter),
            job.clone(),
            schedule,
            stop,
        ));
        Ok(true)
    }

    /// Cancel one job's timer. Returns whether one was armed.
    pub fn stop_job(&self, job_id: JobId) -> bool {
        self.timers.lock().remove(&job_id).is_some_and(|stop| {
            stop.stop();
            debug!(job_id, "cron timer cancelled");
            true
        })
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        let timers: Vec<_> = self.timers.lock().drain().collect();
        for (_, stop) in timers {
            stop.stop();
        }
    }

    /// Whether the job has an armed timer.
    #[must_use]
    pub fn is_armed(&self, job_id: JobId) -> bool {
        self.timers.lock().contains_key(&job_id)
    }
}

async fn run_timer(
    submitter: Arc<ExecutionSubmitter>,
    job: Job,
    schedule: CronSchedule,
    stop: StopToken,
) {
    let mut cursor = now();
    loop {
        let Some(fire_at) = schedule.next_time_after(cursor) else {
            info!(job_id = job.id, schedule = schedule.expression(), "schedule has no further fire time");
            return;
        };
        tokio::select! {
            () = stop.stopped() => return,
            () = tokio::time::sleep(until(fire_at)) => {}
        }
        if stop.is_stopped() {
            return;
        }

        let request = ExecutionRequest {
            parameters: job.parameters.clone(),
            ..ExecutionRequest::default()
        };
        match submitter.submit(job.id, request).await {
            Ok(outcome) => debug!(
                job_id = job.id,
                execution_id = outcome.execution.id,
                created = outcome.created,
                "cron fired"
            ),
            Err(e) => error!(job_id = job.id, error = %e, "cron failed to create execution"),
        }
        cursor = fire_at.max(now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_fire_at_second_zero() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 1, 30).unwrap();
        let next = schedule.next_time_after(base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn irregular_cadence_is_followed() {
        let schedule = CronSchedule::parse("0 0 9,17 * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let first = schedule.next_time_after(base).unwrap();
        let second = schedule.next_time_after(first).unwrap();
        let third = schedule.next_time_after(second).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        assert_eq!(second, Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap());
        assert_eq!(third, Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn start_arms_active_scheduled_jobs() {
        use crate::infra::store::InMemoryExecutionStore;
        use crate::runtime::TokioSpawner;

        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let hourly = store
            .persist_job(Job::new("hourly", "w").with_schedule("0 0 * * * *"))
            .await
            .unwrap();
        let paused = store
            .persist_job(
                Job::new("paused", "w")
                    .with_schedule("0 0 * * * *")
                    .with_status(JobStatus::Inactive),
            )
            .await
            .unwrap();
        let broken = store
            .persist_job(Job::new("broken", "w").with_schedule("at noon"))
            .await
            .unwrap();
        store.persist_job(Job::new("manual", "w")).await.unwrap();

        let trigger = CronTrigger::new(
            Arc::clone(&store),
            Arc::new(ExecutionSubmitter::new(Arc::clone(&store))),
            Notifier::new(),
            TokioSpawner::current(),
        );
        assert_eq!(trigger.start().await.unwrap(), 1);
        assert!(trigger.is_armed(hourly));
        assert!(!trigger.is_armed(paused));
        assert!(!trigger.is_armed(broken));
        let broken = store.get_job(broken).await.unwrap().unwrap();
        assert_eq!(broken.status, JobStatus::Error);

        assert!(trigger.stop_job(hourly));
        assert!(!trigger.stop_job(hourly));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = CronSchedule::parse("every tuesday").unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchedule { .. }));
    }
}
