//! Routes: named handler bindings and the schedule builder.

use crate::app::AppShared;
use crate::cron::Cron;
use crate::error::{Error, Result, app_not_started};
use crate::job::{ErrorHook, Job, SuccessHook};
use crate::middleware::Middleware;
use crate::runner::{RunMode, Strategy};
use crate::scheduler::{Command, ScheduleRequest, Trigger};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-route execution options, fixed at registration.
#[derive(Clone)]
pub struct RouteOptions {
    /// Extra attempts after a failed run; 0 means no retry.
    pub retry: u32,
    /// Per-attempt wall-clock bound.
    pub timeout: Duration,
    /// Stop rescheduling a cron route after this many consecutive
    /// failures. Must be at least 1.
    pub max_cron_failures: u32,
    pub run_mode: RunMode,
    /// Auto-schedule this route on startup.
    pub cron: Option<Cron>,
    /// Persist scheduled jobs of this route.
    pub durable: bool,
    /// Opaque user annotations.
    pub metadata: serde_json::Map<String, Value>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            retry: 0,
            timeout: Duration::from_secs(600),
            max_cron_failures: 10,
            run_mode: RunMode::Auto,
            cron: None,
            durable: true,
            metadata: serde_json::Map::new(),
        }
    }
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_cron_failures(mut self, max_cron_failures: u32) -> Self {
        self.max_cron_failures = max_cron_failures;
        self
    }

    pub fn run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn cron(mut self, cron: impl Into<Cron>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_cron_failures < 1 {
            return Err(Error::InvalidMaxCronFailures);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOptions")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("max_cron_failures", &self.max_cron_failures)
            .field("run_mode", &self.run_mode)
            .field("cron", &self.cron)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

/// Immutable registered binding shared between the table, handles, and
/// the scheduler core. The middleware chain is installed at startup.
pub(crate) struct RouteShared {
    pub name: String,
    pub options: RouteOptions,
    pub strategy: Strategy,
    pub chain: ArcSwapOption<Vec<Arc<dyn Middleware>>>,
    /// Router-contributed middleware, spliced in ahead of the built-ins.
    pub extra_middleware: Vec<Arc<dyn Middleware>>,
}

/// Handle to a registered route.
#[derive(Clone)]
pub struct Route {
    pub(crate) shared: Arc<RouteShared>,
    pub(crate) app: Arc<AppShared>,
}

impl Route {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &RouteOptions {
        &self.shared.options
    }

    /// Bind call arguments and start building a schedule.
    ///
    /// Only valid on a started app; the arguments are serialized
    /// immediately so they can be persisted and shipped to workers.
    pub fn schedule(&self, args: impl Serialize) -> Result<ScheduleBuilder> {
        if !self.app.is_started() {
            return Err(app_not_started("schedule"));
        }
        let arguments = serde_json::to_value(args)
            .map_err(|error| crate::error::SerializeError::Encode(error.to_string()))?;
        Ok(ScheduleBuilder {
            route: self.shared.clone(),
            app: self.app.clone(),
            arguments,
            job_id: None,
            now: None,
            durable: None,
            on_success: Vec::new(),
            on_error: Vec::new(),
            last: None,
        })
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.shared.name)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

/// Binds a trigger to a route plus arguments, producing a [`Job`].
///
/// Terminal methods persist the job and arm its timer. Calling a
/// terminal again on the same builder re-arms the previous job under the
/// same id instead of creating a second one.
pub struct ScheduleBuilder {
    route: Arc<RouteShared>,
    app: Arc<AppShared>,
    arguments: Value,
    job_id: Option<String>,
    now: Option<DateTime<Utc>>,
    durable: Option<bool>,
    on_success: Vec<SuccessHook>,
    on_error: Vec<ErrorHook>,
    last: Option<Job>,
}

impl ScheduleBuilder {
    /// Use an explicit job id instead of a fresh UUID. Colliding ids are
    /// rejected at the terminal call.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Override the clock used for trigger math. Firing order always
    /// follows the engine's own clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Override the route's durability for this job only.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Run after each successful completion, on the scheduler task.
    /// Panics are caught and logged, never propagated.
    pub fn on_success(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success.push(Arc::new(hook));
        self
    }

    /// Run after each failed completion, on the scheduler task.
    pub fn on_error(
        mut self,
        hook: impl Fn(&crate::error::TaskError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error.push(Arc::new(hook));
        self
    }

    /// Schedule at an absolute instant.
    pub async fn at(&mut self, when: DateTime<Utc>) -> Result<Job> {
        let now = self.now.unwrap_or_else(Utc::now);
        let delay_seconds = (when - now).num_milliseconds() as f64 / 1000.0;
        if delay_seconds < 0.0 {
            return Err(Error::NegativeDelay { delay_seconds });
        }
        self.submit(when, now, Trigger::At { when }).await
    }

    /// Schedule after a relative delay in seconds.
    pub async fn delay(&mut self, delay_seconds: f64) -> Result<Job> {
        if delay_seconds < 0.0 {
            return Err(Error::NegativeDelay { delay_seconds });
        }
        let now = self.now.unwrap_or_else(Utc::now);
        let when = now + chrono::Duration::milliseconds((delay_seconds * 1000.0) as i64);
        self.submit(when, now, Trigger::At { when }).await
    }

    /// Schedule on a recurring cron expression; the first run is at
    /// `next_run(now)`.
    pub async fn cron(&mut self, cron: impl Into<Cron>) -> Result<Job> {
        let cron = cron.into();
        let schedule = self.app.cron_parser.parse(&cron.expression)?;
        let now = self.now.unwrap_or_else(Utc::now);
        let first = schedule
            .next_run(now)
            .ok_or_else(|| Error::InvalidCron {
                expression: cron.expression.clone(),
                reason: "no upcoming occurrence".into(),
            })?;
        self.submit(first, now, Trigger::Cron { schedule, cron }).await
    }

    async fn submit(
        &mut self,
        exec_at: DateTime<Utc>,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<Job> {
        // Re-arm the previous job only when the trigger still matches
        // (same kind, and for cron the same expression); anything else
        // cancels it and starts fresh under the previous id.
        let mut existing = None;
        if let Some(last) = self.last.take() {
            let reusable = match &trigger {
                Trigger::At { .. } => last.inner.cron.is_none(),
                Trigger::Cron { cron, .. } => last
                    .inner
                    .cron
                    .as_ref()
                    .is_some_and(|state| state.schedule.expression() == cron.expression),
            };
            if reusable {
                existing = Some(last.inner.clone());
            } else {
                let job_id = last.id();
                last.cancel().await?;
                self.job_id = Some(job_id);
            }
        }

        let request = ScheduleRequest {
            route: self.route.clone(),
            arguments: self.arguments.clone(),
            exec_at,
            now,
            trigger,
            job_id: self.job_id.clone(),
            durable: self.durable.unwrap_or(self.route.options.durable),
            persist: true,
            existing,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        };

        let commands = self.app.core_commands().ok_or(Error::SchedulerStopped)?;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        commands
            .send(Command::Schedule {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::SchedulerStopped)?;
        let job = reply_rx.await.map_err(|_| Error::SchedulerStopped)??;
        self.last = Some(job.clone());
        Ok(job)
    }
}

impl std::fmt::Debug for ScheduleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleBuilder")
            .field("route", &self.route.name)
            .field("arguments", &self.arguments)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}
