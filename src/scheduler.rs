//! The timer and cron engine.
//!
//! One task owns every mutable structure: the earliest-deadline-first
//! heap, the live job registry, the in-flight task set, and all durable
//! store calls. Everything else talks to it over the command channel, so
//! status transitions, persistence, and cron rescheduling are serialized
//! without locks.
//!
//! Timer entries are invalidated lazily: re-arming or canceling a job
//! bumps its generation, and stale heap entries are dropped when they
//! surface.

use crate::config::{SchedulerConfig, State};
use crate::error::{Error, Result, TaskError};
use crate::job::{CronJobState, Job, JobInner, JobStatus};
use crate::middleware::{self, JobContext, JobInfo};
use crate::route::RouteShared;
use crate::serialize::Serializer;
use crate::store::{AtArguments, CronArguments, JobStore, Message, ScheduledJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

/// How a job was triggered; drives persistence and rescheduling.
pub(crate) enum Trigger {
    At {
        when: DateTime<Utc>,
    },
    Cron {
        schedule: Arc<dyn crate::cron::CronSchedule>,
        cron: crate::cron::Cron,
    },
}

impl Trigger {
    fn is_cron(&self) -> bool {
        matches!(self, Trigger::Cron { .. })
    }
}

/// A schedule submission from a builder or from crash recovery.
pub(crate) struct ScheduleRequest {
    pub route: Arc<RouteShared>,
    pub arguments: Value,
    pub exec_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub trigger: Trigger,
    pub job_id: Option<String>,
    pub durable: bool,
    /// False when the durable record already exists (crash recovery).
    pub persist: bool,
    /// Re-arm this job instead of creating a new one, preserving its id.
    pub existing: Option<Arc<JobInner>>,
    pub on_success: Vec<crate::job::SuccessHook>,
    pub on_error: Vec<crate::job::ErrorHook>,
}

pub(crate) enum Command {
    Schedule {
        request: ScheduleRequest,
        reply: oneshot::Sender<Result<Job>>,
    },
    Cancel {
        job_id: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Completion {
    job_id: String,
    generation: u64,
    outcome: std::result::Result<Value, TaskError>,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    exec_at: DateTime<Utc>,
    seq: u64,
    job_id: String,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Equal deadlines fire in schedule order.
        self.exec_at
            .cmp(&other.exec_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct ActiveJob {
    inner: Arc<JobInner>,
    route: Arc<RouteShared>,
    arguments: Value,
}

/// Spawn the scheduler core; returns the command channel and join handle.
pub(crate) fn spawn_core(
    store: Arc<dyn JobStore>,
    serializer: Arc<dyn Serializer>,
    state: State,
    config: Arc<SchedulerConfig>,
) -> (mpsc::Sender<Command>, tokio::task::JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (completion_tx, completion_rx) = mpsc::channel(config.completion_buffer);
    let core = Core {
        commands: command_rx,
        command_tx: command_tx.clone(),
        completion_tx,
        completions: completion_rx,
        heap: BinaryHeap::new(),
        jobs: HashMap::new(),
        running: HashMap::new(),
        tasks: JoinSet::new(),
        store,
        serializer,
        state,
        config,
        seq: 0,
    };
    let join = tokio::spawn(core.run());
    (command_tx, join)
}

struct Core {
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    completion_tx: mpsc::Sender<Completion>,
    completions: mpsc::Receiver<Completion>,
    heap: BinaryHeap<Reverse<TimerEntry>>,
    jobs: HashMap<String, ActiveJob>,
    running: HashMap<String, AbortHandle>,
    tasks: JoinSet<()>,
    store: Arc<dyn JobStore>,
    serializer: Arc<dyn Serializer>,
    state: State,
    config: Arc<SchedulerConfig>,
    seq: u64,
}

impl Core {
    async fn run(mut self) {
        tracing::debug!("scheduler core started");
        loop {
            self.prune_stale_entries();
            let next_deadline = self.heap.peek().map(|Reverse(entry)| entry.exec_at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Schedule { request, reply }) => {
                        let result = self.handle_schedule(request).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Cancel { job_id, reply }) => {
                        self.handle_cancel(&job_id).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.drain().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = sleep_until_deadline(next_deadline), if next_deadline.is_some() => {
                    self.fire_due().await;
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }
        tracing::debug!("scheduler core stopped");
    }

    /// Drop invalidated or already-finished entries from the heap top so
    /// the sleep deadline is always a live one.
    fn prune_stale_entries(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let live = self
                .jobs
                .get(&entry.job_id)
                .is_some_and(|active| {
                    active.inner.generation() == entry.generation
                        && active.inner.status() == JobStatus::Scheduled
                });
            if live {
                break;
            }
            self.heap.pop();
        }
    }

    async fn handle_schedule(&mut self, request: ScheduleRequest) -> Result<Job> {
        if let Some(job_id) = &request.job_id
            && request.existing.is_none()
            && self.jobs.contains_key(job_id)
        {
            return Err(Error::DuplicateJobId {
                job_id: job_id.clone(),
            });
        }

        let inner = match &request.existing {
            Some(inner) => {
                // Re-arm: cancel the previous timer, keep the id.
                let job_id = inner.id();
                inner.rearm(job_id, request.exec_at);
                inner.clone()
            }
            None => {
                let job_id = request
                    .job_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                let cron_state = match &request.trigger {
                    Trigger::Cron { schedule, cron } => {
                        Some(CronJobState::new(schedule.clone(), cron.max_runs))
                    }
                    Trigger::At { .. } => None,
                };
                Arc::new(JobInner::new(
                    job_id,
                    request.route.name.clone(),
                    request.exec_at,
                    request.durable,
                    cron_state,
                    request.on_success.clone(),
                    request.on_error.clone(),
                ))
            }
        };
        let job_id = inner.id();

        if request.durable && request.persist {
            let record = self.build_record(&request, &job_id)?;
            self.store.add_schedule(record).await?;
        }

        self.jobs.insert(
            job_id.clone(),
            ActiveJob {
                inner: inner.clone(),
                route: request.route.clone(),
                arguments: request.arguments.clone(),
            },
        );
        self.push_entry(&inner);

        tracing::debug!(
            job_id = %job_id,
            route = %request.route.name,
            exec_at = %request.exec_at,
            cron = request.trigger.is_cron(),
            "job scheduled"
        );

        Ok(Job {
            inner,
            core: self.command_tx.clone(),
        })
    }

    fn build_record(&self, request: &ScheduleRequest, job_id: &str) -> Result<ScheduledJob> {
        let (cron, at) = match &request.trigger {
            Trigger::Cron { cron, .. } => (
                Some(CronArguments {
                    cron: cron.clone(),
                    job_id: job_id.to_string(),
                    now: request.now,
                }),
                None,
            ),
            Trigger::At { when } => (
                None,
                Some(AtArguments {
                    when: *when,
                    job_id: job_id.to_string(),
                    now: request.now,
                }),
            ),
        };
        let message = Message {
            route_name: request.route.name.clone(),
            job_id: job_id.to_string(),
            arguments: request.arguments.clone(),
            cron,
            at,
        };
        Ok(ScheduledJob {
            job_id: job_id.to_string(),
            func_name: request.route.name.clone(),
            message: message.encode(self.serializer.as_ref())?,
            status: JobStatus::Scheduled,
        })
    }

    fn push_entry(&mut self, inner: &JobInner) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            exec_at: inner.exec_at(),
            seq: self.seq,
            job_id: inner.id(),
            generation: inner.generation(),
        }));
    }

    async fn fire_due(&mut self) {
        let now = Utc::now();
        loop {
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.exec_at <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let Some(active) = self.jobs.get(&entry.job_id) else {
                continue;
            };
            if active.inner.generation() != entry.generation
                || active.inner.status() != JobStatus::Scheduled
            {
                continue;
            }
            self.dispatch(&entry.job_id);
        }
    }

    fn dispatch(&mut self, job_id: &str) {
        let Some(active) = self.jobs.get(job_id) else {
            return;
        };
        let inner = active.inner.clone();
        let route = active.route.clone();
        inner.set_status(JobStatus::Running);

        let ctx = JobContext {
            job: JobInfo {
                id: inner.id(),
                route_name: route.name.clone(),
                exec_at: inner.exec_at(),
            },
            arguments: active.arguments.clone(),
            state: self.state.clone(),
            request_state: State::new(),
            options: route.options.clone(),
            config: self.config.clone(),
        };

        tracing::debug!(job_id = %ctx.job.id, route = %route.name, "job firing");

        let chain = route.chain.load_full().unwrap_or_default();
        let completion_tx = self.completion_tx.clone();
        let completion_job_id = inner.id();
        let generation = inner.generation();
        let abort = self.tasks.spawn(async move {
            let outcome = middleware::dispatch(&chain, &route.strategy, &ctx).await;
            let _ = completion_tx
                .send(Completion {
                    job_id: completion_job_id,
                    generation,
                    outcome,
                })
                .await;
        });
        self.running.insert(inner.id(), abort);
    }

    async fn handle_completion(&mut self, completion: Completion) {
        self.running.remove(&completion.job_id);
        let Some(active) = self.jobs.get(&completion.job_id) else {
            return;
        };
        if active.inner.generation() != completion.generation
            || active.inner.status() == JobStatus::Canceled
        {
            // Canceled or re-armed while the result was in flight.
            return;
        }

        let inner = active.inner.clone();
        let route = active.route.clone();
        let succeeded = completion.outcome.is_ok();
        let status = match &completion.outcome {
            Ok(_) => JobStatus::Success,
            Err(TaskError::Timeout { .. }) => JobStatus::Timeout,
            Err(TaskError::Canceled) => JobStatus::Canceled,
            Err(_) => JobStatus::Error,
        };
        inner.set_outcome(completion.outcome);
        inner.set_status(status);

        match status {
            JobStatus::Success => {
                tracing::debug!(job_id = %completion.job_id, route = %route.name, "job succeeded")
            }
            JobStatus::Canceled => {
                tracing::debug!(job_id = %completion.job_id, route = %route.name, "job canceled")
            }
            _ => tracing::warn!(
                job_id = %completion.job_id,
                route = %route.name,
                status = %status,
                "job failed"
            ),
        }

        if inner.durable {
            if let Err(error) = self.store.delete_schedule(&completion.job_id).await {
                tracing::error!(job_id = %completion.job_id, %error, "failed to delete schedule");
            }
        }

        if status != JobStatus::Canceled {
            self.run_hooks(&inner);
        }

        if status != JobStatus::Canceled
            && inner.cron.is_some()
            && let Err(error) = self.reschedule_cron(&completion.job_id, succeeded).await
        {
            tracing::error!(job_id = %completion.job_id, %error, "cron reschedule failed");
        }

        // Hooks and any cron re-arm happen before waiters resume.
        inner.signal_completion();
    }

    fn run_hooks(&self, inner: &JobInner) {
        match inner.outcome() {
            Some(Ok(value)) => {
                for hook in &inner.on_success {
                    if let Err(panic) =
                        std::panic::catch_unwind(AssertUnwindSafe(|| hook(&value)))
                    {
                        tracing::error!(job_id = %inner.id(), ?panic, "success hook panicked");
                    }
                }
            }
            Some(Err(task_error)) => {
                for hook in &inner.on_error {
                    if let Err(panic) =
                        std::panic::catch_unwind(AssertUnwindSafe(|| hook(&task_error)))
                    {
                        tracing::error!(job_id = %inner.id(), ?panic, "error hook panicked");
                    }
                }
            }
            None => {}
        }
    }

    /// After a cron run: reset or grow the failure streak, then either
    /// re-arm under a fresh id or stop for good.
    async fn reschedule_cron(&mut self, job_id: &str, succeeded: bool) -> Result<()> {
        let Some(active) = self.jobs.remove(job_id) else {
            return Ok(());
        };
        let inner = active.inner.clone();
        let route = active.route.clone();
        let Some(cron) = &inner.cron else {
            return Ok(());
        };

        use std::sync::atomic::Ordering;
        let runs = cron.runs.fetch_add(1, Ordering::AcqRel) + 1;
        let failures = if succeeded {
            cron.consecutive_failures.store(0, Ordering::Release);
            0
        } else {
            cron.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        let max_runs_reached = cron.max_runs.is_some_and(|max| runs >= max);
        let failures_exhausted = failures >= route.options.max_cron_failures;
        if max_runs_reached || failures_exhausted {
            tracing::info!(
                job_id = %job_id,
                route = %route.name,
                runs,
                consecutive_failures = failures,
                "cron stopped"
            );
            return Ok(());
        }

        let now = Utc::now();
        let Some(next) = cron.schedule.next_run(now) else {
            tracing::info!(job_id = %job_id, route = %route.name, "cron has no next run, stopping");
            return Ok(());
        };

        let new_id = Uuid::new_v4().simple().to_string();
        let descriptor = crate::cron::Cron {
            expression: cron.schedule.expression().to_string(),
            max_runs: cron.max_runs,
        };

        if inner.durable {
            let message = Message {
                route_name: route.name.clone(),
                job_id: new_id.clone(),
                arguments: active.arguments.clone(),
                cron: Some(CronArguments {
                    cron: descriptor,
                    job_id: new_id.clone(),
                    now,
                }),
                at: None,
            };
            let record = ScheduledJob {
                job_id: new_id.clone(),
                func_name: route.name.clone(),
                message: message.encode(self.serializer.as_ref())?,
                status: JobStatus::Scheduled,
            };
            self.store.add_schedule(record).await?;
        }

        inner.rearm(new_id.clone(), next);
        self.jobs.insert(new_id.clone(), active);
        self.push_entry(&inner);

        tracing::debug!(
            old_job_id = %job_id,
            job_id = %new_id,
            route = %route.name,
            exec_at = %next,
            "cron job re-armed"
        );
        Ok(())
    }

    async fn handle_cancel(&mut self, job_id: &str) {
        let Some(active) = self.jobs.get(job_id) else {
            return;
        };
        let inner = active.inner.clone();
        match inner.status() {
            JobStatus::Scheduled => {
                inner.invalidate_timer();
            }
            JobStatus::Running => {
                if let Some(abort) = self.running.remove(job_id) {
                    abort.abort();
                }
            }
            // Terminal: cancel is a no-op.
            _ => return,
        }

        inner.set_status(JobStatus::Canceled);
        if inner.durable
            && let Err(error) = self.store.delete_schedule(job_id).await
        {
            tracing::error!(job_id = %job_id, %error, "failed to delete schedule on cancel");
        }
        self.jobs.remove(job_id);
        inner.signal_completion();
        tracing::debug!(job_id = %job_id, "job canceled");
    }

    /// Shutdown drain: abort in-flight work, wake every waiter. Durable
    /// records of unfinished jobs are kept so they recover next startup.
    async fn drain(&mut self) {
        for (job_id, abort) in self.running.drain() {
            abort.abort();
            if let Some(active) = self.jobs.get(&job_id) {
                active.inner.set_status(JobStatus::Canceled);
            }
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        for (_, active) in self.jobs.drain() {
            active.inner.invalidate_timer();
            active.inner.signal_completion();
        }
        self.heap.clear();
        tracing::debug!("scheduler core drained");
    }
}

async fn sleep_until_deadline(deadline: Option<DateTime<Utc>>) {
    let Some(deadline) = deadline else {
        return std::future::pending::<()>().await;
    };
    let delay = (deadline - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(secs: i64, seq: u64) -> TimerEntry {
        TimerEntry {
            exec_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            seq,
            job_id: format!("job-{seq}"),
            generation: 0,
        }
    }

    #[test]
    fn test_heap_orders_by_deadline_then_insertion() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(entry(10, 1)));
        heap.push(Reverse(entry(5, 2)));
        heap.push(Reverse(entry(5, 3)));
        heap.push(Reverse(entry(1, 4)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();
        // Earliest deadline first; ties in schedule order.
        assert_eq!(order, vec![4, 2, 3, 1]);
    }
}
