//! Cron expression parsing seam.
//!
//! The engine only needs two things from a cron expression: the next
//! occurrence strictly after a given instant, and the original expression
//! text for persistence. The concrete grammar lives behind [`CronParser`];
//! the default implementation wraps the `cron` crate (seconds-granularity,
//! `@daily`-style shortcuts supported).

use crate::error::Error;
use chrono::{DateTime, Utc};
use std::str::FromStr as _;
use std::sync::Arc;

/// A parsed, reusable cron schedule.
pub trait CronSchedule: Send + Sync {
    /// Next occurrence strictly after `now`, or `None` if the schedule
    /// has no upcoming occurrence.
    fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// The original expression text.
    fn expression(&self) -> &str;
}

/// Factory turning expression text into a schedule.
pub trait CronParser: Send + Sync {
    fn parse(&self, expression: &str) -> Result<Arc<dyn CronSchedule>, Error>;
}

/// Default parser backed by the `cron` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCronParser;

impl CronParser for DefaultCronParser {
    fn parse(&self, expression: &str) -> Result<Arc<dyn CronSchedule>, Error> {
        let schedule = cron::Schedule::from_str(expression).map_err(|error| Error::InvalidCron {
            expression: expression.to_string(),
            reason: error.to_string(),
        })?;
        Ok(Arc::new(CrateSchedule {
            expression: expression.to_string(),
            schedule,
        }))
    }
}

struct CrateSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule for CrateSchedule {
    fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

/// A cron trigger: expression plus an optional total-run bound.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cron {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
}

impl Cron {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            max_runs: None,
        }
    }

    /// Stop rescheduling after this many runs, regardless of outcome.
    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }
}

impl From<&str> for Cron {
    fn from(expression: &str) -> Self {
        Cron::new(expression)
    }
}

impl From<String> for Cron {
    fn from(expression: String) -> Self {
        Cron::new(expression)
    }
}
