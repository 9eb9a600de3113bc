//! Framed line-JSON protocol between the scheduler and worker processes.
//!
//! One JSON document per line in each direction. Responses carry the
//! request's `seq` so a connection can have several requests in flight.

use crate::error::{TaskError, WorkerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// One unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub seq: u64,
    pub job_id: String,
    pub route: String,
    pub arguments: Value,
}

/// Worker's answer to a [`WorkRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub seq: u64,
    pub outcome: WorkOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    Ok { value: Value },
    Err { error: TaskError },
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(frame).map_err(|error| WorkerError::Protocol(error.to_string()))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|_| WorkerError::ConnectionClosed)?;
    writer
        .flush()
        .await
        .map_err(|_| WorkerError::ConnectionClosed)?;
    Ok(())
}

/// Read one frame; `None` on clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R, buf: &mut String) -> Result<Option<T>, WorkerError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    buf.clear();
    let read = reader
        .read_line(buf)
        .await
        .map_err(|_| WorkerError::ConnectionClosed)?;
    if read == 0 {
        return Ok(None);
    }
    serde_json::from_str(buf.trim_end())
        .map(Some)
        .map_err(|error| WorkerError::Protocol(error.to_string()))
}
