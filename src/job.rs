//! Job handles and status tracking.
//!
//! A [`Job`] is one scheduled invocation of a route. The scheduler core
//! owns every transition; handles only observe state and submit cancel
//! requests. Completion is signalled through an epoch counter rather than
//! the status itself because a cron job goes straight back to
//! `Scheduled` after each run, and a waiter subscribing around that
//! moment must not miss the terminal transition.

use crate::cron::CronSchedule;
use crate::error::{Error, Result, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Success,
    Error,
    Timeout,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Timeout => "timeout",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "error" => Some(JobStatus::Error),
            "timeout" => Some(JobStatus::Timeout),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses never change again (for one-shot jobs; a cron
    /// job is re-armed with a fresh id after a terminal run).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Error | JobStatus::Timeout | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub(crate) type SuccessHook = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type ErrorHook = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// Cron bookkeeping attached to a recurring job.
pub(crate) struct CronJobState {
    pub schedule: Arc<dyn CronSchedule>,
    pub max_runs: Option<u32>,
    pub consecutive_failures: AtomicU32,
    pub runs: AtomicU32,
}

impl CronJobState {
    pub fn new(schedule: Arc<dyn CronSchedule>, max_runs: Option<u32>) -> Self {
        Self {
            schedule,
            max_runs,
            consecutive_failures: AtomicU32::new(0),
            runs: AtomicU32::new(0),
        }
    }
}

/// Shared job state. The scheduler core is the only writer.
pub(crate) struct JobInner {
    id: RwLock<String>,
    route_name: String,
    exec_at: RwLock<DateTime<Utc>>,
    pub durable: bool,
    status: watch::Sender<JobStatus>,
    epoch: watch::Sender<u64>,
    outcome: RwLock<Option<std::result::Result<Value, TaskError>>>,
    /// Bumped whenever the job is re-armed; stale heap entries carry an
    /// older generation and are dropped when they surface.
    generation: AtomicU64,
    pub cron: Option<CronJobState>,
    pub on_success: Vec<SuccessHook>,
    pub on_error: Vec<ErrorHook>,
}

impl JobInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        route_name: String,
        exec_at: DateTime<Utc>,
        durable: bool,
        cron: Option<CronJobState>,
        on_success: Vec<SuccessHook>,
        on_error: Vec<ErrorHook>,
    ) -> Self {
        Self {
            id: RwLock::new(id),
            route_name,
            exec_at: RwLock::new(exec_at),
            durable,
            status: watch::Sender::new(JobStatus::Scheduled),
            epoch: watch::Sender::new(0),
            outcome: RwLock::new(None),
            generation: AtomicU64::new(0),
            cron,
            on_success,
            on_error,
        }
    }

    pub fn id(&self) -> String {
        self.id.read().expect("job lock poisoned").clone()
    }

    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    pub fn exec_at(&self) -> DateTime<Utc> {
        *self.exec_at.read().expect("job lock poisoned")
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: JobStatus) {
        self.status.send_replace(status);
    }

    pub fn outcome(&self) -> Option<std::result::Result<Value, TaskError>> {
        self.outcome.read().expect("job lock poisoned").clone()
    }

    pub fn set_outcome(&self, outcome: std::result::Result<Value, TaskError>) {
        *self.outcome.write().expect("job lock poisoned") = Some(outcome);
    }

    /// Wake every waiter blocked in [`Job::wait`].
    pub fn signal_completion(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn subscribe_completions(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Re-arm the job at a new instant under a (possibly fresh) id,
    /// invalidating any timer entry armed for the previous generation.
    pub fn rearm(&self, id: String, exec_at: DateTime<Utc>) -> u64 {
        *self.id.write().expect("job lock poisoned") = id;
        *self.exec_at.write().expect("job lock poisoned") = exec_at;
        self.status.send_replace(JobStatus::Scheduled);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Invalidate any armed timer entry without changing status.
    pub fn invalidate_timer(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn cron_failures(&self) -> u32 {
        self.cron
            .as_ref()
            .map(|cron| cron.consecutive_failures.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for JobInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInner")
            .field("id", &self.id())
            .field("route_name", &self.route_name)
            .field("exec_at", &self.exec_at())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Awaitable handle to a scheduled job.
#[derive(Clone)]
pub struct Job {
    pub(crate) inner: Arc<JobInner>,
    pub(crate) core: mpsc::Sender<crate::scheduler::Command>,
}

impl Job {
    /// Current job id. A cron job gets a fresh id on every reschedule.
    pub fn id(&self) -> String {
        self.inner.id()
    }

    pub fn route_name(&self) -> &str {
        self.inner.route_name()
    }

    pub fn exec_at(&self) -> DateTime<Utc> {
        self.inner.exec_at()
    }

    pub fn status(&self) -> JobStatus {
        self.inner.status()
    }

    /// Wait for the next completion.
    ///
    /// For a one-shot job that has already finished this returns
    /// immediately; for a cron job it waits for the next run to complete.
    pub async fn wait(&self) {
        let mut rx = self.inner.subscribe_completions();
        let seen = *rx.borrow();
        if self.inner.cron.is_none() && seen >= 1 {
            return;
        }
        let _ = rx.wait_for(|epoch| *epoch > seen).await;
    }

    /// Result of the most recent completed run.
    ///
    /// [`Error::JobNotCompleted`] until the first completion (or forever,
    /// for a canceled job); [`Error::JobFailed`] when the run errored.
    pub fn result(&self) -> Result<Value> {
        match self.inner.outcome() {
            None => Err(Error::JobNotCompleted),
            Some(Ok(value)) => Ok(value),
            Some(Err(task_error)) => Err(Error::JobFailed {
                job_id: self.id(),
                reason: task_error.to_string(),
            }),
        }
    }

    /// The task error of the most recent completed run, if it failed.
    pub fn error(&self) -> Option<TaskError> {
        match self.inner.outcome() {
            Some(Err(task_error)) => Some(task_error),
            _ => None,
        }
    }

    /// Cancel the job. Idempotent: canceling a finished job is a no-op.
    pub async fn cancel(&self) -> Result<()> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.core
            .send(crate::scheduler::Command::Cancel {
                job_id: self.id(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SchedulerStopped)?;
        reply_rx.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Whether a cron job would be re-armed under the given failure bound.
    pub fn should_reschedule(&self, max_cron_failures: u32) -> bool {
        self.inner.cron_failures() < max_cron_failures
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("route_name", &self.route_name())
            .field("exec_at", &self.exec_at())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
