//! Out-of-process execution.
//!
//! Process-mode routes are dispatched by name: the scheduler sends
//! `(route, arguments)` to a worker process, and the worker resolves the
//! route in its own process-local [`Registry`], populated when the worker
//! starts. Nothing callable ever crosses the process boundary.
//!
//! A worker binary is typically the application itself, branching early:
//!
//! ```ignore
//! if jobwheel::worker::is_worker_process() {
//!     let mut registry = jobwheel::worker::Registry::new();
//!     registry.register("reports:rollup", |day: u32| Ok(rollup(day)));
//!     return jobwheel::worker::serve_stdio(Arc::new(registry)).await;
//! }
//! ```

pub mod pool;
pub mod protocol;

use crate::error::TaskError;
use protocol::{WorkOutcome, WorkRequest, WorkResponse, read_frame, write_frame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub use pool::{CommandLauncher, LocalLauncher, WorkerConnection, WorkerLauncher, WorkerPool};

/// Environment variable marking a spawned process as a pool worker.
pub const WORKER_ENV: &str = "JOBWHEEL_WORKER";

/// Whether this process was spawned as a pool worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

pub(crate) type WorkerHandler = Arc<dyn Fn(Value) -> Result<Value, TaskError> + Send + Sync>;

/// Process-local route table used by worker processes.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, WorkerHandler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking handler under a route name. Worker handlers
    /// receive only the decoded arguments; app state lives in the
    /// scheduler process.
    pub fn register<A, R, F>(&mut self, name: impl Into<String>, handler: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        let name = name.into();
        let route = name.clone();
        let erased: WorkerHandler = Arc::new(move |arguments: Value| {
            let args: A = serde_json::from_value(arguments).map_err(|error| {
                TaskError::failed(
                    "decode",
                    format!("failed to decode arguments for {route}: {error}"),
                )
            })?;
            let result = handler(args)?;
            serde_json::to_value(result).map_err(|error| {
                TaskError::failed("encode", format!("failed to encode result: {error}"))
            })
        });
        self.handlers.insert(name, erased);
    }

    /// Register an already-erased handler (used by `App::worker_registry`).
    pub(crate) fn register_erased(&mut self, name: String, handler: WorkerHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_routes(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    fn execute(&self, route: &str, arguments: Value) -> Result<Value, TaskError> {
        let handler = self.handlers.get(route).ok_or_else(|| {
            TaskError::failed("unknown_route", format!("route {route:?} is not registered"))
        })?;
        handler(arguments)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("routes", &self.handlers.len())
            .finish()
    }
}

/// Serve work requests over a byte stream until it closes.
///
/// Handlers run on the blocking pool so a long job does not stall frame
/// IO; requests on one connection are still answered in order.
pub async fn serve<R, W>(registry: Arc<Registry>, reader: R, mut writer: W) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();

    loop {
        let Some(request) = read_frame::<_, WorkRequest>(&mut reader, &mut buf).await? else {
            break;
        };
        tracing::debug!(
            job_id = %request.job_id,
            route = %request.route,
            seq = request.seq,
            "work request received"
        );

        let task_registry = registry.clone();
        let route = request.route.clone();
        let arguments = request.arguments.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || task_registry.execute(&route, arguments))
                .await
            {
                Ok(Ok(value)) => WorkOutcome::Ok { value },
                Ok(Err(error)) => WorkOutcome::Err { error },
                Err(join_error) => WorkOutcome::Err {
                    error: TaskError::failed("panic", join_error.to_string()),
                },
            };

        let response = WorkResponse {
            seq: request.seq,
            outcome,
        };
        write_frame(&mut writer, &response).await?;
    }

    tracing::debug!("work stream closed, worker loop exiting");
    Ok(())
}

/// Serve work requests over stdin/stdout, the pool's default transport.
pub async fn serve_stdio(registry: Arc<Registry>) -> crate::Result<()> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}
