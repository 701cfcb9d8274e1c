//! Directory fan-out
//!
//! The remote folder tree is created first, parents before children, with
//! each folder id cached for its children. Files then go on a worklist
//! drained by a bounded pool of workers. The first failure cancels the
//! remaining siblings.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ChunkOutcome, UploadEngine, UploadTask};
use crate::error::TransferError;
use crate::registry::Registry;
use crate::remote::{RemoteError, RemoteFile};

/// Directory tree flattened for upload; paths are relative to the root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderPlan {
    /// Pre-order: every directory follows its parent
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Walks `root` in sorted, depth-first order. Symlinks are not followed.
pub fn plan(root: &Path) -> Result<FolderPlan, RemoteError> {
    let mut plan = FolderPlan::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| RemoteError::Io(std::io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| RemoteError::Io(std::io::Error::other(e.to_string())))?
            .to_path_buf();
        if entry.file_type().is_dir() {
            plan.dirs.push(relative);
        } else if entry.file_type().is_file() {
            plan.files.push(relative);
        }
    }
    Ok(plan)
}

/// Result of a completed directory upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderUpload {
    pub folder_id: String,
    pub link: String,
    pub files: usize,
    pub size: u64,
}

fn key_of(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

/// Pushes one file chunk by chunk, stopping between chunks when the job is
/// cancelled or no longer registered
pub async fn drive_task(
    engine: &UploadEngine,
    registry: &Registry,
    job_id: &str,
    key: &str,
    task: &mut UploadTask,
    cancel: &CancellationToken,
) -> Result<RemoteFile, TransferError> {
    registry.update_upload(job_id, key, &task.display_name, task.snapshot());

    loop {
        if cancel.is_cancelled() || !registry.contains(job_id) {
            engine.abort(task).await;
            registry.clear_upload_task(job_id, key);
            debug!(job_id, file = %task.display_name, "Upload stopped by cancellation");
            return Err(TransferError::Cancelled);
        }

        match engine.upload_chunk(task).await {
            Ok(ChunkOutcome::Progress(snapshot)) => {
                registry.update_upload(job_id, key, &task.display_name, snapshot);
            }
            Ok(ChunkOutcome::Done(file)) => {
                registry.finish_upload_task(job_id, key);
                return Ok(file);
            }
            Err(e) => {
                engine.abort(task).await;
                registry.clear_upload_task(job_id, key);
                return Err(TransferError::UploadFailed(format!(
                    "{}: {}",
                    task.display_name, e
                )));
            }
        }
    }
}

/// Uploads a single regular file as the job's only Upload Task
pub async fn upload_file(
    engine: &UploadEngine,
    registry: &Registry,
    job_id: &str,
    path: &Path,
    parent: Option<String>,
    cancel: &CancellationToken,
) -> Result<RemoteFile, TransferError> {
    let mut task = UploadTask::from_path(path.to_path_buf(), parent)
        .await
        .map_err(|e| TransferError::UploadFailed(format!("{}: {}", path.display(), e)))?;
    if !registry.begin_upload(job_id, path.to_path_buf(), 1) {
        return Err(TransferError::Cancelled);
    }
    let key = task.display_name.clone();
    drive_task(engine, registry, job_id, &key, &mut task, cancel).await
}

struct WorkItem {
    path: PathBuf,
    key: String,
    parent: String,
}

/// Mirrors the directory at `root` under `parent` and uploads every file
pub async fn upload_tree(
    engine: Arc<UploadEngine>,
    registry: Arc<Registry>,
    job_id: &str,
    root: &Path,
    parent: Option<String>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<FolderUpload, TransferError> {
    let walk_root = root.to_path_buf();
    let plan = tokio::task::spawn_blocking(move || plan(&walk_root))
        .await
        .map_err(|e| TransferError::UploadFailed(e.to_string()))?
        .map_err(|e| TransferError::UploadFailed(format!("{}: {}", root.display(), e)))?;

    if !registry.begin_upload(job_id, root.to_path_buf(), plan.files.len()) {
        return Err(TransferError::Cancelled);
    }

    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job_id.to_string());
    let root_id = create_folder(&engine, &root_name, parent.as_deref()).await?;

    let mut folder_ids: HashMap<PathBuf, String> = HashMap::new();
    folder_ids.insert(PathBuf::new(), root_id.clone());
    for dir in &plan.dirs {
        if cancel.is_cancelled() || !registry.contains(job_id) {
            return Err(TransferError::Cancelled);
        }
        let parent_id = folder_ids
            .get(dir.parent().unwrap_or(Path::new("")))
            .cloned()
            .unwrap_or_else(|| root_id.clone());
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = create_folder(&engine, &name, Some(&parent_id)).await?;
        folder_ids.insert(dir.clone(), id);
    }

    let queue: VecDeque<WorkItem> = plan
        .files
        .iter()
        .map(|relative| WorkItem {
            path: root.join(relative),
            key: key_of(relative),
            parent: folder_ids
                .get(relative.parent().unwrap_or(Path::new("")))
                .cloned()
                .unwrap_or_else(|| root_id.clone()),
        })
        .collect();
    let queue = Arc::new(Mutex::new(queue));

    // Cancelling the fan-out stops siblings without touching the job token
    let fanout = cancel.child_token();
    let mut pool = JoinSet::new();
    for _ in 0..workers.max(1).min(plan.files.len()) {
        pool.spawn(worker(
            engine.clone(),
            registry.clone(),
            job_id.to_string(),
            queue.clone(),
            fanout.clone(),
        ));
    }

    let mut size = 0u64;
    let mut failure: Option<TransferError> = None;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(bytes)) => size += bytes,
            Ok(Err(e)) => {
                if !e.is_cancelled() && failure.is_none() {
                    warn!(job_id, error = %e, "Upload failed, cancelling remaining files");
                    fanout.cancel();
                    failure = Some(e);
                }
            }
            Err(e) => {
                fanout.cancel();
                failure.get_or_insert(TransferError::UploadFailed(e.to_string()));
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if cancel.is_cancelled() || !registry.contains(job_id) {
        return Err(TransferError::Cancelled);
    }

    info!(job_id, folder = %root_id, files = plan.files.len(), "Folder upload complete");
    Ok(FolderUpload {
        link: engine.remote().folder_link(&root_id),
        folder_id: root_id,
        files: plan.files.len(),
        size,
    })
}

async fn create_folder(
    engine: &UploadEngine,
    name: &str,
    parent: Option<&str>,
) -> Result<String, TransferError> {
    engine
        .retry()
        .run(
            "create folder",
            || engine.remote().create_folder(name, parent),
            RemoteError::is_transient,
        )
        .await
        .map_err(|e| TransferError::UploadFailed(format!("folder {}: {}", name, e)))
}

/// Pops files until the worklist is empty or the fan-out is cancelled
async fn worker(
    engine: Arc<UploadEngine>,
    registry: Arc<Registry>,
    job_id: String,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    cancel: CancellationToken,
) -> Result<u64, TransferError> {
    let mut uploaded = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(item) = next else {
            return Ok(uploaded);
        };

        let mut task = UploadTask::from_path(item.path.clone(), Some(item.parent))
            .await
            .map_err(|e| TransferError::UploadFailed(format!("{}: {}", item.key, e)))?;
        let file = drive_task(&engine, &registry, &job_id, &item.key, &mut task, &cancel).await?;
        uploaded += file.size;
    }
}
