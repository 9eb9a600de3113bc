//! Immediate-retry layer.

use crate::error::TaskError;
use crate::middleware::{JobContext, Middleware, Next};
use async_trait::async_trait;
use serde_json::Value;

/// Re-runs the downstream chain on failure, up to `options.retry` extra
/// attempts. Retries are immediate; backoff belongs in a user middleware.
/// Cancellation is never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMiddleware;

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> Result<Value, TaskError> {
        let mut remaining = ctx.options.retry;
        loop {
            match next.run(ctx).await {
                Ok(value) => return Ok(value),
                Err(TaskError::Canceled) => return Err(TaskError::Canceled),
                Err(error) if remaining > 0 => {
                    remaining -= 1;
                    tracing::warn!(
                        job_id = %ctx.job.id,
                        route = %ctx.job.route_name,
                        %error,
                        attempts_remaining = remaining + 1,
                        "job attempt failed, retrying"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}
