//! Execution pipeline: the middleware chain wrapping every job run.
//!
//! A chain is built once per route at startup: user middlewares in
//! registration order, then the built-in error-mapping, retry, and
//! timeout layers, terminating in the route's run strategy. The timeout
//! sits innermost so it bounds each attempt; retry wraps it so a timed
//! out attempt is retriable; error mapping wraps retry so handlers see
//! only the final error.
//!
//! A middleware may return without calling [`Next::run`]; the returned
//! value then becomes the job result and the terminal handler never runs.

pub mod catch;
pub mod retry;
pub mod timeout;

use crate::config::{SchedulerConfig, State};
use crate::error::TaskError;
use crate::route::RouteOptions;
use crate::runner::Strategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

pub use catch::{CatchMiddleware, ErrorHandler, ErrorHandlers, CATCH_ALL};
pub use retry::RetryMiddleware;
pub use timeout::TimeoutMiddleware;

/// Snapshot of the job a chain invocation is running for.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub route_name: String,
    pub exec_at: DateTime<Utc>,
}

/// Everything a middleware or handler can see about the current run.
#[derive(Clone)]
pub struct JobContext {
    pub job: JobInfo,
    pub arguments: Value,
    /// App-wide shared state, populated by the lifespan hook.
    pub state: State,
    /// Scratch state scoped to this execution attempt chain.
    pub request_state: State,
    pub options: RouteOptions,
    pub config: Arc<SchedulerConfig>,
}

impl JobContext {
    /// Decode the scheduled arguments into a concrete type.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.arguments.clone()).map_err(|error| {
            TaskError::failed(
                "decode",
                format!("failed to decode arguments for {}: {error}", self.job.route_name),
            )
        })
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// A layer wrapping job execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> Result<Value, TaskError>;
}

/// The remainder of the chain, ending in the route's run strategy.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    strategy: &'a Strategy,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], strategy: &'a Strategy) -> Self {
        Self { chain, strategy }
    }

    /// Run the rest of the chain. `Next` is `Copy`, so a middleware can
    /// drive the downstream more than once (that is how retry works).
    pub async fn run(self, ctx: &JobContext) -> Result<Value, TaskError> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    chain: rest,
                    strategy: self.strategy,
                };
                middleware.handle(ctx, next).await
            }
            None => self.strategy.invoke(ctx).await,
        }
    }
}

/// Entry point used by the scheduler core for one job execution.
pub(crate) async fn dispatch(
    chain: &[Arc<dyn Middleware>],
    strategy: &Strategy,
    ctx: &JobContext,
) -> Result<Value, TaskError> {
    Next::new(chain, strategy).run(ctx).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runner;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn test_context(arguments: Value) -> JobContext {
        JobContext {
            job: JobInfo {
                id: "job-1".into(),
                route_name: "tests:route".into(),
                exec_at: Utc::now(),
            },
            arguments,
            state: State::new(),
            request_state: State::new(),
            options: RouteOptions::default(),
            config: Arc::new(SchedulerConfig::default()),
        }
    }

    fn echo_strategy() -> Strategy {
        Strategy::Inline(runner::erase_blocking(|n: i64, _ctx: JobContext| Ok(n + 1)))
    }

    struct CountingMiddleware(Arc<AtomicU32>);

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> Result<Value, TaskError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(ctx).await
        }
    }

    struct ShortCircuitMiddleware;

    #[async_trait]
    impl Middleware for ShortCircuitMiddleware {
        async fn handle(&self, _ctx: &JobContext, _next: Next<'_>) -> Result<Value, TaskError> {
            Ok(json!("short-circuited"))
        }
    }

    #[tokio::test]
    async fn test_chain_reaches_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(CountingMiddleware(calls.clone()))];
        let strategy = echo_strategy();
        let ctx = test_context(json!(1));

        let result = dispatch(&chain, &strategy, &ctx).await.unwrap();
        assert_eq!(result, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ShortCircuitMiddleware),
            Arc::new(CountingMiddleware(calls.clone())),
        ];
        let strategy = echo_strategy();
        let ctx = test_context(json!(1));

        let result = dispatch(&chain, &strategy, &ctx).await.unwrap();
        assert_eq!(result, json!("short-circuited"));
        // Nothing downstream of the short circuit ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_args_decode_failure() {
        let ctx = test_context(json!("not a number"));
        let error = ctx.args::<i64>().unwrap_err();
        assert_eq!(error.code(), "decode");
    }
}
