//! Error-mapping layer.

use crate::error::TaskError;
use crate::middleware::{JobContext, Middleware, Next};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Code registered to catch any otherwise-unhandled task error.
pub const CATCH_ALL: &str = "*";

/// Maps a final task error to a replacement result.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: TaskError) -> Result<Value, TaskError>;
}

/// Handler table keyed by task-error code.
pub type ErrorHandlers = HashMap<String, Arc<dyn ErrorHandler>>;

pub(crate) struct FnErrorHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ErrorHandler for FnErrorHandler<F>
where
    F: Fn(TaskError) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn handle(&self, error: TaskError) -> Result<Value, TaskError> {
        (self.0)(error).await
    }
}

/// Applies the app's error handlers to the final error of a run.
///
/// Lookup is most-specific-first: the error's exact code, then the
/// catch-all. A matching handler's return value becomes the job result.
/// Cancellation is never mapped.
pub struct CatchMiddleware {
    handlers: Arc<ErrorHandlers>,
}

impl CatchMiddleware {
    pub fn new(handlers: Arc<ErrorHandlers>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Middleware for CatchMiddleware {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> Result<Value, TaskError> {
        match next.run(ctx).await {
            Ok(value) => Ok(value),
            Err(TaskError::Canceled) => Err(TaskError::Canceled),
            Err(error) => {
                let handler = self
                    .handlers
                    .get(error.code())
                    .or_else(|| self.handlers.get(CATCH_ALL));
                match handler {
                    Some(handler) => {
                        tracing::debug!(
                            job_id = %ctx.job.id,
                            route = %ctx.job.route_name,
                            code = error.code(),
                            "mapping job error through registered handler"
                        );
                        handler.handle(error).await
                    }
                    None => Err(error),
                }
            }
        }
    }
}
