//! Durable job storage.
//!
//! Every durable job has exactly one persisted record while it is
//! scheduled or running; the record is removed together with the terminal
//! transition (or replaced, for a cron job that re-arms). The record body
//! is a [`Message`] encoded through the configured serializer, so backends
//! only ever see opaque bytes.

pub mod memory;
pub mod sqlite;

use crate::cron::Cron;
use crate::error::{SerializeError, StoreError};
use crate::job::JobStatus;
use crate::serialize::Serializer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One persisted schedule row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub func_name: String,
    pub message: Vec<u8>,
    pub status: JobStatus,
}

/// Pluggable durable backend for the scheduled set.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Open resources. Called once during app startup.
    async fn startup(&self) -> Result<(), StoreError>;

    /// Flush and close. Called once during app shutdown.
    async fn shutdown(&self) -> Result<(), StoreError>;

    async fn add_schedule(&self, job: ScheduledJob) -> Result<(), StoreError>;

    async fn delete_schedule(&self, job_id: &str) -> Result<(), StoreError>;

    /// All persisted schedules in insertion order.
    async fn get_schedules(&self) -> Result<Vec<ScheduledJob>, StoreError>;
}

/// Serialized form of a scheduled job, the durable record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub route_name: String,
    pub job_id: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronArguments>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<AtArguments>,
}

/// Trigger details for a persisted cron job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronArguments {
    pub cron: Cron,
    pub job_id: String,
    pub now: DateTime<Utc>,
}

/// Trigger details for a persisted one-shot job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtArguments {
    pub when: DateTime<Utc>,
    pub job_id: String,
    pub now: DateTime<Utc>,
}

impl Message {
    pub fn encode(&self, serializer: &dyn Serializer) -> Result<Vec<u8>, SerializeError> {
        let value =
            serde_json::to_value(self).map_err(|error| SerializeError::Encode(error.to_string()))?;
        serializer.dumpb(&value)
    }

    pub fn decode(bytes: &[u8], serializer: &dyn Serializer) -> Result<Self, SerializeError> {
        let value = serializer.loadb(bytes)?;
        serde_json::from_value(value).map_err(|error| SerializeError::Decode(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::JsonSerializer;
    use serde_json::json;

    #[test]
    fn test_message_round_trip() {
        let message = Message {
            route_name: "reports:rollup".into(),
            job_id: "abc123".into(),
            arguments: json!({"positional": [7], "keyword": {}}),
            cron: Some(CronArguments {
                cron: Cron::new("* * * * * *").with_max_runs(2),
                job_id: "abc123".into(),
                now: Utc::now(),
            }),
            at: None,
        };
        let encoded = message.encode(&JsonSerializer).unwrap();
        let decoded = Message::decode(&encoded, &JsonSerializer).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_message_omits_absent_triggers() {
        let message = Message {
            route_name: "r".into(),
            job_id: "j".into(),
            arguments: Value::Null,
            cron: None,
            at: None,
        };
        let encoded = message.encode(&JsonSerializer).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(!text.contains("cron"));
        assert!(!text.contains("\"at\""));
    }
}
