//! SQLite-backed durable store.

use crate::error::StoreError;
use crate::job::JobStatus;
use crate::store::{JobStore, ScheduledJob};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable store over a single SQLite file (or `:memory:`).
///
/// The pool is opened in `startup()` and closed in `shutdown()`; calls in
/// between run on one connection so insertion order is stable.
pub struct SqliteStore {
    path: PathBuf,
    pool: ArcSwapOption<SqlitePool>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: ArcSwapOption::const_empty(),
        }
    }

    /// Store that lives only as long as the open pool.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    fn pool(&self) -> Result<Arc<SqlitePool>, StoreError> {
        self.pool.load_full().ok_or(StoreError::Closed)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn startup(&self) -> Result<(), StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);

        // A single connection keeps `:memory:` databases alive across
        // calls and makes rowid ordering deterministic.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                job_id TEXT PRIMARY KEY,
                func_name TEXT NOT NULL,
                message BLOB NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        self.pool.store(Some(Arc::new(pool)));
        tracing::debug!(path = %self.path.display(), "sqlite store opened");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.swap(None) {
            pool.close().await;
            tracing::debug!(path = %self.path.display(), "sqlite store closed");
        }
        Ok(())
    }

    async fn add_schedule(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let pool = self.pool()?;
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (job_id, func_name, message, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                func_name = excluded.func_name,
                message = excluded.message,
                status = excluded.status
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.func_name)
        .bind(&job.message)
        .bind(job.status.as_str())
        .execute(pool.as_ref())
        .await?;
        Ok(())
    }

    async fn delete_schedule(&self, job_id: &str) -> Result<(), StoreError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM scheduled_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool.as_ref())
            .await?;
        Ok(())
    }

    async fn get_schedules(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query(
            r#"
            SELECT job_id, func_name, message, status
            FROM scheduled_jobs
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| {
                let job_id: String = row.try_get("job_id")?;
                let status_text: String = row.try_get("status")?;
                let status =
                    JobStatus::parse(&status_text).ok_or_else(|| StoreError::Corrupt {
                        job_id: job_id.clone(),
                        reason: format!("unknown status {status_text:?}"),
                    })?;
                Ok(ScheduledJob {
                    job_id,
                    func_name: row.try_get("func_name")?,
                    message: row.try_get("message")?,
                    status,
                })
            })
            .collect()
    }
}
