//! Top-level error types for jobwheel.

use serde::{Deserialize, Serialize};

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "cannot {operation:?} - application must be {required_state:?}, \
         but is currently {actual_state:?}"
    )]
    AppState {
        operation: &'static str,
        required_state: &'static str,
        actual_state: &'static str,
    },

    #[error("job result is not ready yet, call wait() before reading result()")]
    JobNotCompleted,

    #[error("job_id: {job_id}, failed_reason: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("negative delay_seconds ({delay_seconds}) is not supported")]
    NegativeDelay { delay_seconds: f64 },

    #[error("duplicate job id: {job_id}")]
    DuplicateJobId { job_id: String },

    #[error(
        "route {name:?} is not attached to any app, \
         did you forget to call include_router()?"
    )]
    RouteNotAttached { name: String },

    #[error("max_cron_failures must be >= 1. Use 1 for 'stop on first error'.")]
    InvalidMaxCronFailures,

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("scheduler is not running")]
    SchedulerStopped,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `AppState` error for operations that require a started app.
pub(crate) fn app_not_started(operation: &'static str) -> Error {
    Error::AppState {
        operation,
        required_state: "started",
        actual_state: "not started",
    }
}

/// `AppState` error for operations that require a not-yet-started app.
pub(crate) fn app_already_started(operation: &'static str) -> Error {
    Error::AppState {
        operation,
        required_state: "not started",
        actual_state: "started",
    }
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to SQLite: {0}")]
    Connect(sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("store is not open, call startup() first")]
    Closed,

    #[error("malformed persisted record for job {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Serializer encode/decode errors.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// Out-of-process worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker connection closed")]
    ConnectionClosed,

    #[error("malformed worker frame: {0}")]
    Protocol(String),
}

/// Error produced by a job handler or by the pipeline wrapping it.
///
/// Unlike [`Error`], task errors travel through the middleware chain, are
/// recorded on the job handle, and cross the worker-process boundary, so
/// they are serializable and carry a stable `code` that error handlers
/// match on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("{message}")]
    Failed { code: String, message: String },

    #[error("job timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("job canceled")]
    Canceled,
}

impl TaskError {
    /// A failure with an explicit code for error-handler matching.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A middleware declined to run the job at all.
    pub fn job_skipped() -> Self {
        TaskError::failed(
            "job_skipped",
            "job was not executed: a middleware short-circuited without calling next",
        )
    }

    /// A middleware consumed the execution without reaching the terminal handler.
    pub fn handler_skipped() -> Self {
        TaskError::failed(
            "handler_skipped",
            "job handler was not executed: a middleware short-circuited without calling next",
        )
    }

    /// Stable code used for most-specific error-handler lookup.
    pub fn code(&self) -> &str {
        match self {
            TaskError::Failed { code, .. } => code,
            TaskError::Timeout { .. } => "timeout",
            TaskError::Canceled => "canceled",
        }
    }
}
