//! jobwheel: an in-process job scheduler.
//!
//! Register named handlers (async or blocking), then schedule executions
//! at an absolute instant, after a delay, or on a recurring cron
//! expression. Every scheduled job is an awaitable [`Job`] handle;
//! durable jobs are persisted through a pluggable store and recovered on
//! the next startup.
//!
//! ```ignore
//! let app = jobwheel::App::builder().durable(false).build();
//! let add_one = app.register_blocking(
//!     "math:add_one",
//!     jobwheel::RouteOptions::default(),
//!     |n: i64, _ctx| Ok(n + 1),
//! )?;
//!
//! app.startup().await?;
//! let job = add_one.schedule(1)?.delay(0.0).await?;
//! job.wait().await;
//! assert_eq!(job.result()?, serde_json::json!(2));
//! app.shutdown().await?;
//! ```

pub mod app;
pub mod config;
pub mod cron;
pub mod error;
pub mod job;
pub mod middleware;
mod registry;
pub mod route;
pub mod router;
pub mod runner;
mod scheduler;
pub mod serialize;
pub mod store;
pub mod worker;

pub use app::{App, AppBuilder, Lifespan};
pub use config::{SchedulerConfig, State};
pub use cron::{Cron, CronParser, CronSchedule, DefaultCronParser};
pub use error::{Error, Result, SerializeError, StoreError, TaskError, WorkerError};
pub use job::{Job, JobStatus};
pub use middleware::{CATCH_ALL, JobContext, JobInfo, Middleware, Next};
pub use route::{Route, RouteOptions, ScheduleBuilder};
pub use router::{DeferredRoute, Router};
pub use runner::RunMode;
pub use serialize::{GzJsonSerializer, JsonSerializer, Serializer};
pub use store::{JobStore, MemoryStore, Message, ScheduledJob, SqliteStore};
