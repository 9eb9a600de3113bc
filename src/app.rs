//! The application facade: registration window, lifecycle, recovery.
//!
//! An [`App`] is built, routes are registered, then `startup()` flips it
//! into the running window: the lifespan hook runs, middleware chains
//! are installed, the scheduler core starts, persisted jobs are
//! recovered, and auto-cron routes are activated. `shutdown()` drains
//! in-flight work and closes the pool and store; records of unfinished
//! durable jobs survive for the next startup.

use crate::config::{SchedulerConfig, State};
use crate::cron::{CronParser, DefaultCronParser};
use crate::error::{Error, Result, TaskError, app_already_started};
use crate::middleware::{
    CatchMiddleware, ErrorHandlers, JobContext, JobInfo, Middleware, RetryMiddleware,
    TimeoutMiddleware,
};
use crate::middleware::catch::FnErrorHandler;
use crate::registry::RouteTable;
use crate::route::{Route, RouteOptions, RouteShared};
use crate::router::Router;
use crate::runner::{self, Handler, Strategy};
use crate::scheduler::{self, Command, ScheduleRequest, Trigger};
use crate::serialize::{JsonSerializer, Serializer};
use crate::store::{JobStore, Message, MemoryStore, SqliteStore};
use crate::worker::{self, WorkerLauncher, WorkerPool};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;

/// Default SQLite file used when no store is configured.
pub const DEFAULT_DB_PATH: &str = "jobwheel.db";

/// User-supplied bracket around the running window.
///
/// `startup` runs before the app accepts schedules and may seed the
/// shared state; `shutdown` runs after the drain.
#[async_trait]
pub trait Lifespan: Send + Sync {
    async fn startup(&self, state: &State) -> Result<()> {
        let _ = state;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct NoopLifespan;

#[async_trait]
impl Lifespan for NoopLifespan {}

pub(crate) struct CoreHandle {
    commands: mpsc::Sender<Command>,
    join: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Shared app internals referenced by routes, builders, and handles.
pub(crate) struct AppShared {
    pub state: State,
    pub config: Arc<SchedulerConfig>,
    pub serializer: Arc<dyn Serializer>,
    pub store: Arc<dyn JobStore>,
    pub cron_parser: Arc<dyn CronParser>,
    pub pool: Arc<WorkerPool>,
    started: AtomicBool,
    routes: StdRwLock<RouteTable>,
    middleware: StdMutex<VecDeque<Arc<dyn Middleware>>>,
    error_handlers: StdMutex<ErrorHandlers>,
    lifespan: Arc<dyn Lifespan>,
    core: StdRwLock<Option<Arc<CoreHandle>>>,
}

impl AppShared {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn core_commands(&self) -> Option<mpsc::Sender<Command>> {
        self.core
            .read()
            .expect("app lock poisoned")
            .as_ref()
            .map(|core| core.commands.clone())
    }
}

/// Builder for [`App`].
pub struct AppBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    durable: bool,
    serializer: Arc<dyn Serializer>,
    cron_parser: Arc<dyn CronParser>,
    middleware: VecDeque<Arc<dyn Middleware>>,
    error_handlers: ErrorHandlers,
    lifespan: Arc<dyn Lifespan>,
    worker_launcher: Option<Arc<dyn WorkerLauncher>>,
    worker_pool_size: usize,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            store: None,
            durable: true,
            serializer: Arc::new(JsonSerializer),
            cron_parser: Arc::new(DefaultCronParser),
            middleware: VecDeque::new(),
            error_handlers: ErrorHandlers::new(),
            lifespan: Arc::new(NoopLifespan),
            worker_launcher: None,
            worker_pool_size: 1,
        }
    }
}

impl AppBuilder {
    pub fn tz(mut self, tz: chrono_tz::Tz) -> Self {
        self.config.tz = tz;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific durable store.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// `durable(false)` substitutes the in-memory store.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn cron_parser(mut self, cron_parser: Arc<dyn CronParser>) -> Self {
        self.cron_parser = cron_parser;
        self
    }

    /// Append a middleware; constructor order is outermost-first.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push_back(Arc::new(middleware));
        self
    }

    /// Map task errors with this `code` to a replacement result.
    /// Register under [`crate::middleware::CATCH_ALL`] to catch everything.
    pub fn error_handler<F, Fut>(mut self, code: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
    {
        self.error_handlers
            .insert(code.into(), Arc::new(FnErrorHandler(handler)));
        self
    }

    pub fn lifespan(mut self, lifespan: impl Lifespan + 'static) -> Self {
        self.lifespan = Arc::new(lifespan);
        self
    }

    /// Launcher for process-mode workers; defaults to re-spawning the
    /// current executable.
    pub fn worker_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.worker_launcher = Some(launcher);
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn build(self) -> App {
        let store = match (self.store, self.durable) {
            (Some(store), _) => store,
            (None, false) => Arc::new(MemoryStore::new()) as Arc<dyn JobStore>,
            (None, true) => Arc::new(SqliteStore::new(DEFAULT_DB_PATH)) as Arc<dyn JobStore>,
        };
        let pool = match self.worker_launcher {
            Some(launcher) => WorkerPool::new(launcher, self.worker_pool_size),
            None => WorkerPool::current_exe(self.worker_pool_size),
        };

        App {
            inner: Arc::new(AppShared {
                state: State::new(),
                config: Arc::new(self.config),
                serializer: self.serializer,
                store,
                cron_parser: self.cron_parser,
                pool: Arc::new(pool),
                started: AtomicBool::new(false),
                routes: StdRwLock::new(RouteTable::default()),
                middleware: StdMutex::new(self.middleware),
                error_handlers: StdMutex::new(self.error_handlers),
                lifespan: self.lifespan,
                core: StdRwLock::new(None),
            }),
        }
    }
}

/// The in-process job scheduler application.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppShared>,
}

impl Default for App {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Register an async handler. Idempotent by name: re-registering a
    /// name returns the existing route and ignores the new handler.
    pub fn register_async<A, R, F, Fut>(
        &self,
        name: &str,
        options: RouteOptions,
        handler: F,
    ) -> Result<Route>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A, JobContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        self.register_handler(
            name,
            options,
            Handler::Async(runner::erase_async(handler)),
            Vec::new(),
        )
    }

    /// Register a blocking handler; `options.run_mode` picks where it runs.
    pub fn register_blocking<A, R, F>(
        &self,
        name: &str,
        options: RouteOptions,
        handler: F,
    ) -> Result<Route>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A, JobContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        self.register_handler(
            name,
            options,
            Handler::Blocking(runner::erase_blocking(handler)),
            Vec::new(),
        )
    }

    fn register_handler(
        &self,
        name: &str,
        options: RouteOptions,
        handler: Handler,
        extra_middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<Route> {
        options.validate()?;
        if self.is_started() {
            return Err(app_already_started("register"));
        }

        let mut table = self.inner.routes.write().expect("app lock poisoned");
        if let Some(existing) = table.get(name) {
            return Ok(Route {
                shared: existing,
                app: self.inner.clone(),
            });
        }

        let strategy = Strategy::select(handler, options.run_mode, &self.inner.pool);
        let shared = Arc::new(RouteShared {
            name: name.to_string(),
            options: options.clone(),
            strategy,
            chain: ArcSwapOption::const_empty(),
            extra_middleware,
        });
        table.insert(shared.clone());
        if let Some(cron) = &options.cron {
            table.queue_cron(name, cron.clone());
        }
        tracing::debug!(route = %name, run_mode = ?options.run_mode, "route registered");

        Ok(Route {
            shared,
            app: self.inner.clone(),
        })
    }

    /// Look up a registered route by its full name.
    pub fn route(&self, name: &str) -> Option<Route> {
        let table = self.inner.routes.read().expect("app lock poisoned");
        table.get(name).map(|shared| Route {
            shared,
            app: self.inner.clone(),
        })
    }

    /// Prepend a middleware (runs outermost). Pre-start only.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) -> Result<()> {
        if self.is_started() {
            return Err(app_already_started("add_middleware"));
        }
        self.inner
            .middleware
            .lock()
            .expect("app lock poisoned")
            .push_front(Arc::new(middleware));
        Ok(())
    }

    /// Register an error handler by task-error code. Pre-start only.
    pub fn add_error_handler<F, Fut>(&self, code: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(TaskError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
    {
        if self.is_started() {
            return Err(app_already_started("add_exception_handler"));
        }
        self.inner
            .error_handlers
            .lock()
            .expect("app lock poisoned")
            .insert(code.into(), Arc::new(FnErrorHandler(handler)));
        Ok(())
    }

    /// Promote a router tree's deferred routes into this app, joining
    /// prefixes with `:`. Pre-start only.
    pub fn include_router(&self, router: Router) -> Result<()> {
        if self.is_started() {
            return Err(app_already_started("include_router"));
        }
        let mut resolved = Vec::new();
        router.collect("", &[], &mut resolved);
        for pending in resolved {
            let route = self.register_handler(
                &pending.name,
                pending.options.clone(),
                pending.handler.clone(),
                pending.middleware.clone(),
            )?;
            pending.bind(route);
        }
        Ok(())
    }

    /// Build a process-local worker registry from every blocking route.
    ///
    /// Call this in a process spawned with the worker marker and hand it
    /// to [`worker::serve_stdio`]. Worker-side handlers see a synthetic
    /// context: no app state, default options, and the scheduler's job
    /// id only through the request.
    pub fn worker_registry(&self) -> worker::Registry {
        let mut registry = worker::Registry::new();
        let table = self.inner.routes.read().expect("app lock poisoned");
        for shared in table.iter() {
            let handler = match &shared.strategy {
                Strategy::Inline(f) | Strategy::Thread(f) => f.clone(),
                Strategy::Process { handler, .. } => handler.clone(),
                Strategy::Async(_) => continue,
            };
            let name = shared.name.clone();
            let options = shared.options.clone();
            let config = self.inner.config.clone();
            registry.register_erased(
                shared.name.clone(),
                Arc::new(move |arguments: Value| {
                    let ctx = JobContext {
                        job: JobInfo {
                            id: String::new(),
                            route_name: name.clone(),
                            exec_at: Utc::now(),
                        },
                        arguments,
                        state: State::new(),
                        request_state: State::new(),
                        options: options.clone(),
                        config: config.clone(),
                    };
                    handler(ctx)
                }),
            );
        }
        registry
    }

    /// Enter the running window.
    pub async fn startup(&self) -> Result<()> {
        if self.is_started() {
            return Err(app_already_started("startup"));
        }

        self.inner.store.startup().await?;
        self.inner.lifespan.startup(&self.inner.state).await?;
        self.install_chains();

        let (commands, join) = scheduler::spawn_core(
            self.inner.store.clone(),
            self.inner.serializer.clone(),
            self.inner.state.clone(),
            self.inner.config.clone(),
        );
        *self.inner.core.write().expect("app lock poisoned") = Some(Arc::new(CoreHandle {
            commands,
            join: StdMutex::new(Some(join)),
        }));
        self.inner.started.store(true, Ordering::SeqCst);
        tracing::info!("app started");

        self.recover_persisted().await?;
        self.activate_pending_cron().await?;
        Ok(())
    }

    /// Per-route chain: app middleware, router middleware, then the
    /// built-ins with the timeout innermost so it bounds each attempt.
    fn install_chains(&self) {
        let user: Vec<Arc<dyn Middleware>> = self
            .inner
            .middleware
            .lock()
            .expect("app lock poisoned")
            .iter()
            .cloned()
            .collect();
        let handlers = Arc::new(
            self.inner
                .error_handlers
                .lock()
                .expect("app lock poisoned")
                .clone(),
        );

        let table = self.inner.routes.read().expect("app lock poisoned");
        for shared in table.iter() {
            let mut chain = user.clone();
            chain.extend(shared.extra_middleware.iter().cloned());
            chain.push(Arc::new(CatchMiddleware::new(handlers.clone())));
            chain.push(Arc::new(RetryMiddleware));
            chain.push(Arc::new(TimeoutMiddleware));
            shared.chain.store(Some(Arc::new(chain)));
        }
        tracing::debug!(routes = table.len(), "middleware chains installed");
    }

    /// Crash recovery: re-bind persisted schedules to their routes and
    /// re-arm timers at the original instants; past-due jobs fire
    /// immediately. A cron record whose route re-registered the same
    /// auto-cron is superseded and dropped.
    async fn recover_persisted(&self) -> Result<()> {
        let records = self.inner.store.get_schedules().await?;
        if records.is_empty() {
            return Ok(());
        }

        let auto_cron: HashSet<(String, String)> = {
            let table = self.inner.routes.read().expect("app lock poisoned");
            table
                .pending_cron()
                .iter()
                .map(|(name, cron)| (name.clone(), cron.expression.clone()))
                .collect()
        };

        let commands = self
            .inner
            .core_commands()
            .ok_or(Error::SchedulerStopped)?;
        let mut recovered = 0usize;

        for record in records {
            let message = match Message::decode(&record.message, self.inner.serializer.as_ref()) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(job_id = %record.job_id, %error, "skipping corrupt record");
                    continue;
                }
            };

            let Some(route) = self
                .inner
                .routes
                .read()
                .expect("app lock poisoned")
                .get(&message.route_name)
            else {
                tracing::warn!(
                    job_id = %record.job_id,
                    route = %message.route_name,
                    "skipping record for unknown route, keeping it persisted"
                );
                continue;
            };

            let (exec_at, now, trigger) = match (&message.at, &message.cron) {
                (Some(at), _) => (at.when, at.now, Trigger::At { when: at.when }),
                (None, Some(cron_args)) => {
                    let key = (message.route_name.clone(), cron_args.cron.expression.clone());
                    if auto_cron.contains(&key) {
                        tracing::info!(
                            job_id = %record.job_id,
                            route = %message.route_name,
                            "auto-cron re-registered, dropping superseded record"
                        );
                        self.inner.store.delete_schedule(&record.job_id).await?;
                        continue;
                    }
                    let schedule = self.inner.cron_parser.parse(&cron_args.cron.expression)?;
                    let Some(exec_at) = schedule.next_run(cron_args.now) else {
                        self.inner.store.delete_schedule(&record.job_id).await?;
                        continue;
                    };
                    (
                        exec_at,
                        cron_args.now,
                        Trigger::Cron {
                            schedule,
                            cron: cron_args.cron.clone(),
                        },
                    )
                }
                (None, None) => {
                    tracing::warn!(job_id = %record.job_id, "record has no trigger, skipping");
                    continue;
                }
            };

            let request = ScheduleRequest {
                route,
                arguments: message.arguments,
                exec_at,
                now,
                trigger,
                job_id: Some(message.job_id),
                durable: true,
                persist: false,
                existing: None,
                on_success: Vec::new(),
                on_error: Vec::new(),
            };
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            commands
                .send(Command::Schedule {
                    request,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| Error::SchedulerStopped)?;
            reply_rx.await.map_err(|_| Error::SchedulerStopped)??;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "recovered persisted jobs");
        }
        Ok(())
    }

    /// Schedule every route registered with a cron option.
    async fn activate_pending_cron(&self) -> Result<()> {
        let pending = self
            .inner
            .routes
            .write()
            .expect("app lock poisoned")
            .take_pending_cron();
        for (name, cron) in pending {
            let Some(route) = self.route(&name) else {
                continue;
            };
            let mut builder = route.schedule(Value::Null)?;
            builder.cron(cron.clone()).await?;
            tracing::info!(route = %name, expression = %cron.expression, "auto-cron scheduled");
        }
        Ok(())
    }

    /// Leave the running window: drain in-flight work, close the worker
    /// pool, run the lifespan exit, close the store. Shutting down a
    /// stopped app is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let core = self.inner.core.write().expect("app lock poisoned").take();
        if let Some(core) = core {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if core
                .commands
                .send(Command::Shutdown { reply: reply_tx })
                .await
                .is_ok()
            {
                let _ = reply_rx.await;
            }
            let join = core.join.lock().expect("app lock poisoned").take();
            if let Some(join) = join {
                let _ = join.await;
            }
        }

        self.inner.pool.shutdown().await;
        self.inner.lifespan.shutdown().await?;
        self.inner.store.shutdown().await?;
        tracing::info!("app stopped");
        Ok(())
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
