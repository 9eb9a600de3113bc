//! Per-attempt timeout layer.

use crate::error::TaskError;
use crate::middleware::{JobContext, Middleware, Next};
use async_trait::async_trait;
use serde_json::Value;

/// Bounds each execution attempt by `options.timeout`.
///
/// Installed innermost, so every retry gets the full budget. Expiry drops
/// the downstream future and surfaces a retriable timeout error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutMiddleware;

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, ctx: &JobContext, next: Next<'_>) -> Result<Value, TaskError> {
        let limit = ctx.options.timeout;
        match tokio::time::timeout(limit, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    job_id = %ctx.job.id,
                    route = %ctx.job.route_name,
                    timeout_secs = limit.as_secs(),
                    "job attempt timed out"
                );
                Err(TaskError::Timeout {
                    timeout_secs: limit.as_secs(),
                })
            }
        }
    }
}
