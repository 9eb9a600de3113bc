//! Run strategies: how a route's handler is actually invoked.
//!
//! Handlers are type-erased at registration: typed arguments are decoded
//! from the scheduled JSON payload, and typed results are encoded back,
//! so the rest of the engine only moves `serde_json::Value`s around.

use crate::error::TaskError;
use crate::middleware::JobContext;
use crate::worker::WorkerPool;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Where a blocking handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Async handlers run on the runtime; blocking handlers inline.
    #[default]
    Auto,
    /// On the scheduler's runtime thread, blocking it. Keep it short.
    Inline,
    /// On the blocking thread pool.
    Thread,
    /// On an out-of-process worker, dispatched by route name.
    Process,
}

/// Type-erased async handler.
pub type AsyncHandler =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

/// Type-erased blocking handler.
pub type BlockingHandler = Arc<dyn Fn(JobContext) -> Result<Value, TaskError> + Send + Sync>;

/// A registered handler before strategy selection.
#[derive(Clone)]
pub(crate) enum Handler {
    Async(AsyncHandler),
    Blocking(BlockingHandler),
}

/// The per-route invocation strategy, fixed at registration.
#[derive(Clone)]
pub(crate) enum Strategy {
    Async(AsyncHandler),
    Inline(BlockingHandler),
    Thread(BlockingHandler),
    /// Dispatched to the pool by route name. The handler is kept so a
    /// worker process built from the same registrations can serve it.
    Process {
        pool: Arc<WorkerPool>,
        handler: BlockingHandler,
    },
}

impl Strategy {
    /// Async handlers always run on the runtime; blocking handlers map
    /// their run mode verbatim, with `Auto` meaning inline.
    pub fn select(handler: Handler, run_mode: RunMode, pool: &Arc<WorkerPool>) -> Strategy {
        match handler {
            Handler::Async(f) => Strategy::Async(f),
            Handler::Blocking(f) => match run_mode {
                RunMode::Auto | RunMode::Inline => Strategy::Inline(f),
                RunMode::Thread => Strategy::Thread(f),
                RunMode::Process => Strategy::Process {
                    pool: pool.clone(),
                    handler: f,
                },
            },
        }
    }

    pub async fn invoke(&self, ctx: &JobContext) -> Result<Value, TaskError> {
        match self {
            Strategy::Async(f) => f(ctx.clone()).await,
            Strategy::Inline(f) => f(ctx.clone()),
            Strategy::Thread(f) => {
                let f = f.clone();
                let ctx = ctx.clone();
                tokio::task::spawn_blocking(move || f(ctx))
                    .await
                    .map_err(|error| TaskError::failed("panic", error.to_string()))?
            }
            Strategy::Process { pool, .. } => {
                pool.execute(&ctx.job.id, &ctx.job.route_name, ctx.arguments.clone())
                    .await
            }
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Async(_) => "Async",
            Strategy::Inline(_) => "Inline",
            Strategy::Thread(_) => "Thread",
            Strategy::Process { .. } => "Process",
        };
        f.debug_struct(name).finish_non_exhaustive()
    }
}

/// Erase a typed async handler.
///
/// The handler is cloned into each invocation so the produced future can
/// be `'static`.
pub(crate) fn erase_async<A, R, F, Fut>(handler: F) -> AsyncHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(A, JobContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
{
    Arc::new(move |ctx: JobContext| {
        let handler = handler.clone();
        Box::pin(async move {
            let args = ctx.args::<A>()?;
            let result = handler(args, ctx).await?;
            encode_result(result)
        })
    })
}

/// Erase a typed blocking handler.
pub(crate) fn erase_blocking<A, R, F>(handler: F) -> BlockingHandler
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(A, JobContext) -> Result<R, TaskError> + Send + Sync + 'static,
{
    Arc::new(move |ctx: JobContext| {
        let args = ctx.args::<A>()?;
        let result = handler(args, ctx)?;
        encode_result(result)
    })
}

fn encode_result<R: Serialize>(result: R) -> Result<Value, TaskError> {
    serde_json::to_value(result)
        .map_err(|error| TaskError::failed("encode", format!("failed to encode result: {error}")))
}
