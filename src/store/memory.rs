//! In-memory store for non-durable apps and tests.

use crate::error::StoreError;
use crate::store::{JobStore, ScheduledJob};
use async_trait::async_trait;
use std::sync::Mutex;

/// Keeps the scheduled set in a `Vec`, preserving insertion order.
///
/// Used when an app opts out of durability; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<ScheduledJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn startup(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_schedule(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        match rows.iter_mut().find(|row| row.job_id == job.job_id) {
            Some(row) => *row = job,
            None => rows.push(job),
        }
        Ok(())
    }

    async fn delete_schedule(&self, job_id: &str) -> Result<(), StoreError> {
        self.rows
            .lock()
            .expect("store lock poisoned")
            .retain(|row| row.job_id != job_id);
        Ok(())
    }

    async fn get_schedules(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        Ok(self.rows.lock().expect("store lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn record(id: &str) -> ScheduledJob {
        ScheduledJob {
            job_id: id.into(),
            func_name: "tests:noop".into(),
            message: Vec::new(),
            status: JobStatus::Scheduled,
        }
    }

    #[tokio::test]
    async fn test_insertion_order_and_upsert() {
        let store = MemoryStore::new();
        store.add_schedule(record("a")).await.unwrap();
        store.add_schedule(record("b")).await.unwrap();

        // Upserting an existing id keeps its original position.
        let mut updated = record("a");
        updated.status = JobStatus::Running;
        store.add_schedule(updated.clone()).await.unwrap();

        let schedules = store.get_schedules().await.unwrap();
        assert_eq!(schedules, vec![updated, record("b")]);

        store.delete_schedule("b").await.unwrap();
        assert_eq!(store.get_schedules().await.unwrap().len(), 1);
    }
}
