//! Scheduler-side worker pool.
//!
//! Workers are launched lazily on first use, up to the pool size, and
//! requests round-robin across them. The launcher is pluggable: the
//! default spawns the current executable with the worker marker set;
//! [`LocalLauncher`] keeps everything in-process for tests and
//! single-process deployments while still exercising the wire protocol.

use crate::error::{TaskError, WorkerError};
use crate::worker::protocol::{WorkOutcome, WorkRequest, WorkResponse, read_frame, write_frame};
use crate::worker::{Registry, WORKER_ENV, serve};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

/// Creates worker connections on demand.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerConnection, WorkerError>;
}

type PendingReplies = Arc<StdMutex<HashMap<u64, oneshot::Sender<WorkOutcome>>>>;

/// A live link to one worker, multiplexing requests by sequence number.
///
/// Writes and reads run on separate tasks sharing a pending-reply map;
/// when either side of the stream fails, dropping the map's entries
/// wakes every in-flight caller with a closed-connection error.
pub struct WorkerConnection {
    tx: mpsc::Sender<(WorkRequest, oneshot::Sender<WorkOutcome>)>,
    writer_task: tokio::task::JoinHandle<()>,
    reader_task: tokio::task::JoinHandle<()>,
    child: StdMutex<Option<tokio::process::Child>>,
}

impl WorkerConnection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::build(reader, writer, None)
    }

    fn build(
        reader: impl AsyncRead + Send + Unpin + 'static,
        mut writer: impl AsyncWrite + Send + Unpin + 'static,
        child: Option<tokio::process::Child>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<(WorkRequest, oneshot::Sender<WorkOutcome>)>(32);
        let pending: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));

        let writer_pending = pending.clone();
        let writer_task = tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                // Register before writing so a fast response cannot race
                // the bookkeeping.
                writer_pending
                    .lock()
                    .expect("pool lock poisoned")
                    .insert(request.seq, reply);
                if let Err(error) = write_frame(&mut writer, &request).await {
                    tracing::warn!(%error, "worker write failed, dropping connection");
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = String::new();
            loop {
                match read_frame::<_, WorkResponse>(&mut reader, &mut buf).await {
                    Ok(Some(response)) => {
                        let reply = reader_pending
                            .lock()
                            .expect("pool lock poisoned")
                            .remove(&response.seq);
                        if let Some(reply) = reply {
                            // Receiver may be gone if the job was canceled.
                            let _ = reply.send(response.outcome);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "worker read failed, dropping connection");
                        break;
                    }
                }
            }
            // Wake every in-flight caller with a closed channel.
            reader_pending
                .lock()
                .expect("pool lock poisoned")
                .clear();
        });

        Self {
            tx,
            writer_task,
            reader_task,
            child: StdMutex::new(child),
        }
    }

    pub(crate) async fn execute(&self, request: WorkRequest) -> Result<WorkOutcome, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| WorkerError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ConnectionClosed)
    }

    fn shutdown(&self) {
        self.writer_task.abort();
        self.reader_task.abort();
        if let Some(mut child) = self.child.lock().expect("pool lock poisoned").take() {
            // The worker reads EOF on stdin when we drop the writer; the
            // kill is a backstop for workers stuck mid-job.
            let _ = child.start_kill();
        }
    }
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConnection").finish_non_exhaustive()
    }
}

/// Launches worker subprocesses speaking the protocol over stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    /// Program to spawn; `None` means the current executable.
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: Some(program.into()),
            args,
        }
    }

    /// Re-spawn the current executable; the child sees [`WORKER_ENV`] set
    /// and is expected to branch into `worker::serve_stdio`.
    pub fn current_exe() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self) -> Result<WorkerConnection, WorkerError> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|error| WorkerError::Launch(error.to_string()))?,
        };

        let mut child = tokio::process::Command::new(&program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| WorkerError::Launch(error.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Launch("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Launch("worker stdout not captured".into()))?;

        tracing::info!(program = %program.display(), "worker process launched");
        Ok(WorkerConnection::build(stdout, stdin, Some(child)))
    }
}

/// Runs the worker serve loop inside this process over an in-memory pipe.
pub struct LocalLauncher {
    registry: Arc<Registry>,
}

impl LocalLauncher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(&self) -> Result<WorkerConnection, WorkerError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(error) = serve(registry, server_read, server_write).await {
                tracing::warn!(%error, "local worker loop failed");
            }
        });
        let (client_read, client_write) = tokio::io::split(client);
        Ok(WorkerConnection::new(client_read, client_write))
    }
}

impl std::fmt::Debug for LocalLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLauncher").finish_non_exhaustive()
    }
}

/// Lazy, shared pool of worker connections.
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    size: usize,
    seq: AtomicU64,
    next: AtomicUsize,
    workers: Mutex<Vec<Arc<WorkerConnection>>>,
}

impl WorkerPool {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, size: usize) -> Self {
        Self {
            launcher,
            size: size.max(1),
            seq: AtomicU64::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Pool spawning the current executable as its workers.
    pub fn current_exe(size: usize) -> Self {
        Self::new(Arc::new(CommandLauncher::current_exe()), size)
    }

    pub(crate) async fn execute(
        &self,
        job_id: &str,
        route: &str,
        arguments: Value,
    ) -> Result<Value, TaskError> {
        let connection = self
            .connection()
            .await
            .map_err(|error| TaskError::failed("worker", error.to_string()))?;
        let request = WorkRequest {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            job_id: job_id.to_string(),
            route: route.to_string(),
            arguments,
        };
        match connection.execute(request).await {
            Ok(WorkOutcome::Ok { value }) => Ok(value),
            Ok(WorkOutcome::Err { error }) => Err(error),
            Err(error) => Err(TaskError::failed("worker", error.to_string())),
        }
    }

    async fn connection(&self) -> Result<Arc<WorkerConnection>, WorkerError> {
        let mut workers = self.workers.lock().await;
        if workers.len() < self.size {
            let connection = self.launcher.launch().await?;
            workers.push(Arc::new(connection));
            tracing::debug!(workers = workers.len(), size = self.size, "worker added to pool");
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[index].clone())
    }

    /// Close every connection and kill spawned workers.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.shutdown();
        }
        tracing::debug!("worker pool shut down");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_pool(size: usize) -> WorkerPool {
        let mut registry = Registry::new();
        registry.register("math:add_one", |n: i64| Ok(n + 1));
        registry.register("math:fail", |(): ()| -> Result<i64, TaskError> {
            Err(TaskError::failed("boom", "nope"))
        });
        WorkerPool::new(Arc::new(LocalLauncher::new(Arc::new(registry))), size)
    }

    #[tokio::test]
    async fn test_pool_executes_by_route_name() {
        let pool = local_pool(1);
        let value = pool.execute("job-1", "math:add_one", json!(3)).await.unwrap();
        assert_eq!(value, json!(4));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_errors_come_back_typed() {
        let pool = local_pool(1);
        let error = pool
            .execute("job-1", "math:fail", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "boom");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_route_reported_by_worker() {
        let pool = local_pool(1);
        let error = pool
            .execute("job-1", "math:missing", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "unknown_route");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_round_robin_across_workers() {
        let pool = local_pool(2);
        for n in 0..4 {
            let value = pool.execute("job", "math:add_one", json!(n)).await.unwrap();
            assert_eq!(value, json!(n + 1));
        }
        let workers = pool.workers.lock().await;
        assert_eq!(workers.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails() {
        let pool = local_pool(1);
        pool.execute("job", "math:add_one", json!(0)).await.unwrap();
        pool.shutdown().await;
        // The pool relaunches lazily, so a fresh call spins up a new worker.
        let value = pool.execute("job", "math:add_one", json!(1)).await.unwrap();
        assert_eq!(value, json!(2));
    }
}
