//! Upload Engine
//!
//! [`UploadEngine::upload_chunk`] moves one chunk per call so callers can
//! check for cancellation and report progress between chunks. Directory
//! fan-out lives in [`folder`].

pub mod folder;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::humanize;
use crate::observability::Metrics;
use crate::remote::{ChunkAck, FileMeta, RemoteError, RemoteFile, RemoteStore};
use crate::retry::RetryPolicy;

/// Mime type from the file extension, `application/octet-stream` otherwise
pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// One file being pushed to the remote store
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub source_path: PathBuf,
    pub display_name: String,
    pub mime_type: String,
    /// Remote folder receiving the file
    pub parent: Option<String>,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub started_at: Instant,
    cursor: Option<String>,
    pub remote_link: Option<String>,
}

impl UploadTask {
    pub fn new(source_path: PathBuf, total_bytes: u64, parent: Option<String>) -> Self {
        let display_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_path.to_string_lossy().into_owned());
        Self {
            mime_type: guess_mime(&source_path),
            display_name,
            source_path,
            parent,
            bytes_uploaded: 0,
            total_bytes,
            started_at: Instant::now(),
            cursor: None,
            remote_link: None,
        }
    }

    /// Reads the size from disk
    pub async fn from_path(source_path: PathBuf, parent: Option<String>) -> Result<Self, RemoteError> {
        let metadata = tokio::fs::metadata(&source_path).await?;
        Ok(Self::new(source_path, metadata.len(), parent))
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.remote_link.is_some()
    }

    fn meta(&self) -> FileMeta {
        FileMeta {
            name: self.display_name.clone(),
            mime_type: self.mime_type.clone(),
            parent: self.parent.clone(),
            size: self.total_bytes,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.bytes_uploaded as f64 / elapsed
        } else {
            0.0
        };
        ProgressSnapshot {
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: self.total_bytes,
            speed,
            eta: humanize::estimate_remaining(
                self.total_bytes.saturating_sub(self.bytes_uploaded),
                speed,
            ),
        }
    }
}

/// Upload progress at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    /// Bytes per second since the task started
    pub speed: f64,
    /// `None` while the speed is zero
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        humanize::fraction(self.bytes_uploaded, self.total_bytes)
    }
}

/// Result of one `upload_chunk` call
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Progress(ProgressSnapshot),
    Done(RemoteFile),
}

pub struct UploadEngine {
    remote: Arc<dyn RemoteStore>,
    chunk_size: u64,
    retry: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl UploadEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, chunk_size: u64, retry: RetryPolicy) -> Self {
        Self {
            remote,
            chunk_size: chunk_size.max(1),
            retry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Transmits the next chunk of `task`
    pub async fn upload_chunk(&self, task: &mut UploadTask) -> Result<ChunkOutcome, RemoteError> {
        if task.total_bytes == 0 {
            let meta = task.meta();
            let file = self
                .retry
                .run(
                    "create empty file",
                    || self.remote.create_empty(&meta),
                    RemoteError::is_transient,
                )
                .await?;
            task.remote_link = Some(file.link.clone());
            return Ok(ChunkOutcome::Done(file));
        }

        let cursor = match task.cursor.clone() {
            Some(cursor) => cursor,
            None => {
                let meta = task.meta();
                let cursor = self
                    .retry
                    .run(
                        "open upload session",
                        || self.remote.open_session(&meta),
                        RemoteError::is_transient,
                    )
                    .await?;
                task.cursor = Some(cursor.clone());
                task.started_at = Instant::now();
                cursor
            }
        };

        let offset = task.bytes_uploaded;
        let data = read_chunk(&task.source_path, offset, self.chunk_size, task.total_bytes).await?;
        let sent = data.len() as u64;
        let total = task.total_bytes;

        let ack = self
            .retry
            .run(
                "upload chunk",
                || self.remote.put_chunk(&cursor, offset, data.clone(), total),
                RemoteError::is_transient,
            )
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.chunk_uploaded(sent);
        }

        match ack {
            ChunkAck::Partial { received } => {
                if received < offset + sent {
                    debug!(
                        file = %task.display_name,
                        received,
                        expected = offset + sent,
                        "Remote store acknowledged a short chunk"
                    );
                }
                task.bytes_uploaded = received;
                let snapshot = task.snapshot();
                debug!(file = %task.display_name, uploaded = received, total, "Chunk uploaded");
                Ok(ChunkOutcome::Progress(snapshot))
            }
            ChunkAck::Done(file) => {
                task.bytes_uploaded = task.total_bytes;
                task.cursor = None;
                task.remote_link = Some(file.link.clone());
                info!(file = %task.display_name, size = file.size, "Upload complete");
                Ok(ChunkOutcome::Done(file))
            }
        }
    }

    /// Best-effort release of an unfinished session
    pub async fn abort(&self, task: &mut UploadTask) {
        let Some(cursor) = task.cursor.take() else {
            return;
        };
        if let Err(e) = self.remote.abort_session(&cursor).await {
            warn!(file = %task.display_name, error = %e, "Failed to abort upload session");
        }
    }
}

async fn read_chunk(path: &Path, offset: u64, chunk_size: u64, total: u64) -> Result<Bytes, RemoteError> {
    let len = chunk_size.min(total.saturating_sub(offset));
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
