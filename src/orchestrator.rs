//! Transfer Orchestrator
//!
//! Reacts to daemon notifications. Start and stop are handled inline; completion
//! and error handling read the daemon status with backoff, so they run as
//! tracked tasks. Every terminal outcome is replied to the job's chat and
//! published on the outcome channel, then the job leaves the registry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatClient, ChatId};
use crate::config::StorageConfig;
use crate::daemon::{DaemonEvent, DownloadStatus, Gateway, StatusSnapshot, Submission, generate_gid};
use crate::error::TransferError;
use crate::humanize::ByteSize;
use crate::observability::Metrics;
use crate::registry::{Completion, JobId, Registry, TransferJob};
use crate::remote::RemoteFile;
use crate::upload::UploadEngine;
use crate::upload::folder::{self, FolderUpload};

/// Characters left unescaped in an index link path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// How often a reseed task checks whether the daemon is done seeding
const RESEED_POLL: Duration = Duration::from_secs(5);

/// Terminal result of one job, as shown to the invoker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    File {
        job_id: JobId,
        chat: ChatId,
        name: String,
        link: String,
        size: u64,
        index_link: Option<String>,
    },
    Folder {
        job_id: JobId,
        chat: ChatId,
        name: String,
        link: String,
        files: usize,
        size: u64,
        index_link: Option<String>,
    },
    Failed {
        job_id: JobId,
        chat: ChatId,
        name: String,
        status: DownloadStatus,
        error_code: Option<String>,
        message: String,
    },
    Cancelled {
        job_id: JobId,
        chat: ChatId,
        name: String,
    },
}

impl TransferOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            TransferOutcome::File { job_id, .. }
            | TransferOutcome::Folder { job_id, .. }
            | TransferOutcome::Failed { job_id, .. }
            | TransferOutcome::Cancelled { job_id, .. } => job_id,
        }
    }

    pub fn chat(&self) -> ChatId {
        match self {
            TransferOutcome::File { chat, .. }
            | TransferOutcome::Folder { chat, .. }
            | TransferOutcome::Failed { chat, .. }
            | TransferOutcome::Cancelled { chat, .. } => *chat,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::File { .. } | TransferOutcome::Folder { .. })
    }

    /// Reply text; cancellations are silent
    pub fn render(&self) -> Option<String> {
        match self {
            TransferOutcome::File {
                name,
                link,
                size,
                index_link,
                ..
            } => {
                let mut text = format!("**{}**\nSize: {}\nLink: {}", name, ByteSize(*size), link);
                if let Some(index) = index_link {
                    text.push_str(&format!("\nIndex: {}", index));
                }
                Some(text)
            }
            TransferOutcome::Folder {
                name,
                link,
                files,
                size,
                index_link,
                ..
            } => {
                let mut text = format!(
                    "**{}**\nFolder: {} files, {}\nLink: {}",
                    name,
                    files,
                    ByteSize(*size),
                    link
                );
                if let Some(index) = index_link {
                    text.push_str(&format!("\nIndex: {}", index));
                }
                Some(text)
            }
            TransferOutcome::Failed {
                name,
                status,
                error_code,
                message,
                ..
            } => {
                let mut text = format!("**{}**\nStatus: {}\nError: {}", name, status.label(), message);
                if let Some(code) = error_code {
                    text.push_str(&format!(" (code {})", code));
                }
                Some(text)
            }
            TransferOutcome::Cancelled { .. } => None,
        }
    }
}

/// Storage-side settings the orchestrator needs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub parent_id: Option<String>,
    pub index_link: Option<String>,
    pub upload_workers: usize,
}

impl PipelineSettings {
    pub fn from_config(storage: &StorageConfig) -> Self {
        Self {
            parent_id: storage.parent_id.clone(),
            index_link: storage.index_link.clone(),
            upload_workers: storage.upload_workers,
        }
    }

    /// `<index_link>/<percent-encoded name>`, with a trailing slash for folders
    pub fn index_link_for(&self, name: &str, folder: bool) -> Option<String> {
        let base = self.index_link.as_deref()?.trim_end_matches('/');
        let encoded = utf8_percent_encode(name, PATH_SEGMENT);
        Some(if folder {
            format!("{}/{}/", base, encoded)
        } else {
            format!("{}/{}", base, encoded)
        })
    }
}

enum Delivered {
    File(RemoteFile),
    Folder(FolderUpload),
}

pub struct Orchestrator {
    gateway: Arc<Gateway>,
    registry: Arc<Registry>,
    engine: Arc<UploadEngine>,
    chat: Arc<dyn ChatClient>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
    outcomes: broadcast::Sender<TransferOutcome>,
    handlers: TaskTracker,
    reseeds: Mutex<JoinSet<()>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<Gateway>,
        registry: Arc<Registry>,
        engine: Arc<UploadEngine>,
        chat: Arc<dyn ChatClient>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(256);
        Self {
            gateway,
            registry,
            engine,
            chat,
            metrics,
            settings,
            outcomes,
            handlers: TaskTracker::new(),
            reseeds: Mutex::new(JoinSet::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferOutcome> {
        self.outcomes.subscribe()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Consumes daemon notifications until shutdown or the channel closes
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DaemonEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!("Download daemon event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("Orchestrator event loop stopped");
    }

    /// Dispatches one notification; also used for events synthesised by the poll
    pub async fn handle(self: &Arc<Self>, event: DaemonEvent) {
        match event {
            DaemonEvent::Start(gid) => self.on_start(&gid),
            DaemonEvent::Stop(gid) => self.on_stop(&gid).await,
            DaemonEvent::Complete(gid) => {
                let this = Arc::clone(self);
                self.handlers.spawn(async move { this.on_complete(gid, false).await });
            }
            DaemonEvent::BtComplete(gid) => {
                let this = Arc::clone(self);
                self.handlers.spawn(async move { this.on_complete(gid, true).await });
            }
            DaemonEvent::Error(gid) => {
                let this = Arc::clone(self);
                self.handlers.spawn(async move { this.on_error(gid).await });
            }
        }
    }

    fn on_start(&self, gid: &str) {
        if self.registry.confirm_started(gid) {
            info!(gid, "Download started");
        } else {
            debug!(gid, "Start event for unknown job ignored");
        }
    }

    async fn on_stop(&self, gid: &str) {
        let Some(job) = self.registry.take_downloading(gid) else {
            debug!(gid, "Stop event for unknown job ignored");
            return;
        };
        job.cancel.cancel();
        info!(gid, name = %job.name, "Download stopped by the daemon");
        self.cancelled(job).await;
    }

    async fn on_error(&self, gid: String) {
        if !self.registry.contains(&gid) {
            debug!(gid = %gid, "Error event for unknown job ignored");
            return;
        }
        let snapshot = self.gateway.status(&gid, &[]).await.ok();
        if let Some(snapshot) = &snapshot {
            self.registry.apply_snapshot(&gid, snapshot);
        }
        let Some(job) = self.registry.take_downloading(&gid) else {
            debug!(gid = %gid, "Error event for job past download ignored");
            return;
        };

        let (code, message) = match &snapshot {
            Some(s) => (
                s.error_code.clone().or(job.error_code.clone()),
                s.error_message.clone().or(job.error_message.clone()),
            ),
            None => (job.error_code.clone(), job.error_message.clone()),
        };
        let message = message.unwrap_or_else(|| "download failed".to_string());
        error!(gid = %gid, code = ?code, error = %message, "Download failed");

        self.metrics.job_failed();
        self.publish(TransferOutcome::Failed {
            job_id: job.job_id,
            chat: job.chat,
            name: job.name,
            status: DownloadStatus::Error,
            error_code: code,
            message: TransferError::DownloadFailed(message).to_string(),
        })
        .await;
    }

    async fn on_complete(self: Arc<Self>, gid: String, bt_event: bool) {
        let Some(claim) = self.registry.begin_completion(&gid) else {
            debug!(gid = %gid, "Completion for unknown or claimed job ignored");
            return;
        };

        let snapshot = match self.gateway.status(&gid, &[]).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail(&gid, e).await;
                return;
            }
        };

        if !snapshot.is_complete(bt_event) {
            debug!(gid = %gid, status = ?snapshot.status, "Daemon does not report completion yet");
            self.registry.revert(&gid);
            return;
        }
        self.registry.apply_snapshot(&gid, &snapshot);

        if snapshot.is_metadata() {
            self.resolve_metadata(&gid, &snapshot).await;
            return;
        }

        let Some(path) = snapshot.payload_path() else {
            self.fail(
                &gid,
                TransferError::UploadFailed("completed download has no local path".into()),
            )
            .await;
            return;
        };

        let delivered = self.upload_payload(&gid, &claim, &path).await;
        let uploaded = delivered.is_ok();
        self.settle(&gid, delivered).await;

        if uploaded && snapshot.is_torrent() {
            if let (Some(source), Some(dir)) = (claim.source, snapshot.dir.clone()) {
                self.schedule_reseed(gid, source, dir);
            }
        }
    }

    /// Uploads a file that never went through the daemon (chat attachment)
    pub fn upload_local(self: &Arc<Self>, job_id: JobId, path: PathBuf) {
        let this = Arc::clone(self);
        self.handlers.spawn(async move {
            let Some(claim) = this.registry.begin_completion(&job_id) else {
                debug!(job_id = %job_id, "Local upload for unknown job ignored");
                return;
            };
            let delivered = this.upload_payload(&job_id, &claim, &path).await;
            this.settle(&job_id, delivered).await;
        });
    }

    async fn resolve_metadata(&self, gid: &str, snapshot: &StatusSnapshot) {
        match snapshot.followed_by.as_slice() {
            [successor] => {
                if self.registry.supersede(gid, successor) {
                    info!(gid, successor = %successor, "Torrent metadata resolved");
                } else {
                    info!(gid, successor = %successor, "Metadata job cancelled while resolving");
                    self.gateway.force_remove_all(&snapshot.followed_by).await;
                }
            }
            [] => {
                self.fail(
                    gid,
                    TransferError::UploadFailed("torrent metadata resolved without a payload job".into()),
                )
                .await;
            }
            many => {
                self.fail(
                    gid,
                    TransferError::UploadFailed(format!(
                        "torrent metadata resolved into {} payload jobs ({})",
                        many.len(),
                        many.join(", ")
                    )),
                )
                .await;
                self.gateway.force_remove_all(many).await;
            }
        }
    }

    async fn upload_payload(
        &self,
        job_id: &str,
        claim: &Completion,
        path: &Path,
    ) -> Result<Delivered, TransferError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::UploadFailed(format!("{}: {}", path.display(), e)))?;
        let parent = self.settings.parent_id.clone();

        if metadata.is_dir() {
            info!(job_id, path = %path.display(), "Uploading folder");
            folder::upload_tree(
                self.engine.clone(),
                self.registry.clone(),
                job_id,
                path,
                parent,
                self.settings.upload_workers,
                &claim.cancel,
            )
            .await
            .map(Delivered::Folder)
        } else {
            info!(job_id, path = %path.display(), "Uploading file");
            folder::upload_file(&self.engine, &self.registry, job_id, path, parent, &claim.cancel)
                .await
                .map(Delivered::File)
        }
    }

    async fn settle(&self, job_id: &str, delivered: Result<Delivered, TransferError>) {
        match delivered {
            Ok(delivered) => self.deliver(job_id, delivered).await,
            Err(TransferError::Cancelled) => {
                // cancellation already removed the job and reported it
                self.registry.take(job_id);
                debug!(job_id, "Upload abandoned after cancellation");
            }
            Err(e) => self.fail(job_id, e).await,
        }
    }

    async fn deliver(&self, job_id: &str, delivered: Delivered) {
        let Some(job) = self.registry.take(job_id) else {
            debug!(job_id, "Upload finished for a cancelled job");
            return;
        };
        let outcome = match delivered {
            Delivered::File(file) => {
                info!(job_id, link = %file.link, size = file.size, "Transfer complete");
                TransferOutcome::File {
                    index_link: self.settings.index_link_for(&job.name, false),
                    job_id: job.job_id,
                    chat: job.chat,
                    name: job.name,
                    link: file.link,
                    size: file.size,
                }
            }
            Delivered::Folder(upload) => {
                info!(job_id, link = %upload.link, files = upload.files, "Transfer complete");
                TransferOutcome::Folder {
                    index_link: self.settings.index_link_for(&job.name, true),
                    job_id: job.job_id,
                    chat: job.chat,
                    name: job.name,
                    link: upload.link,
                    files: upload.files,
                    size: upload.size,
                }
            }
        };
        self.metrics.job_completed();
        self.publish(outcome).await;
    }

    /// Terminal failure: the job is removed and the error reported once
    async fn fail(&self, job_id: &str, error: TransferError) {
        let Some(job) = self.registry.take(job_id) else {
            debug!(job_id, error = %error, "Failure for a job already removed");
            return;
        };
        job.cancel.cancel();
        error!(job_id, code = error.code(), error = %error, "Transfer failed");
        self.metrics.job_failed();
        self.publish(TransferOutcome::Failed {
            job_id: job.job_id,
            chat: job.chat,
            name: job.name,
            status: DownloadStatus::Error,
            error_code: job.error_code,
            message: error.to_string(),
        })
        .await;
    }

    /// Reports a job removed by cancellation or a daemon stop
    pub async fn cancelled(&self, job: TransferJob) {
        self.metrics.job_cancelled();
        self.publish(TransferOutcome::Cancelled {
            job_id: job.job_id,
            chat: job.chat,
            name: job.name,
        })
        .await;
    }

    async fn publish(&self, outcome: TransferOutcome) {
        if let Some(text) = outcome.render() {
            if let Err(e) = self.chat.send_message(outcome.chat(), &text).await {
                warn!(job_id = outcome.job_id(), error = %e, "Failed to send result message");
            }
        }
        let _ = self.outcomes.send(outcome);
        self.release_idle_bindings().await;
    }

    /// Deletes the status message of every chat left without jobs
    pub async fn release_idle_bindings(&self) {
        for (chat, binding) in self.registry.release_idle_bindings() {
            if let Err(e) = self.chat.delete_message(chat, binding.message_id).await {
                warn!(chat, message_id = binding.message_id, error = %e, "Failed to delete status message");
            }
        }
    }

    fn schedule_reseed(&self, original: JobId, source: Submission, dir: PathBuf) {
        let gateway = self.gateway.clone();
        let mut reseeds = self.reseeds.lock().unwrap_or_else(PoisonError::into_inner);
        while reseeds.try_join_next().is_some() {}
        reseeds.spawn(reseed(gateway, original, source, dir));
    }

    /// Reseed tasks still running
    pub fn pending_reseeds(&self) -> usize {
        let mut reseeds = self.reseeds.lock().unwrap_or_else(PoisonError::into_inner);
        while reseeds.try_join_next().is_some() {}
        reseeds.len()
    }

    /// Waits for completion handlers, then gives reseed tasks `grace` before
    /// aborting them
    pub async fn drain(&self, grace: Duration) {
        self.handlers.close();
        if tokio::time::timeout(grace, self.handlers.wait()).await.is_err() {
            warn!("Completion handlers still running at shutdown");
        }

        let mut reseeds = std::mem::take(&mut *self.reseeds.lock().unwrap_or_else(PoisonError::into_inner));
        if reseeds.is_empty() {
            return;
        }
        let finished = tokio::time::timeout(grace, async {
            while reseeds.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !finished {
            warn!(remaining = reseeds.len(), "Aborting unfinished reseed tasks");
            reseeds.shutdown().await;
        }
    }
}

/// Best-effort seeding after upload. Failures are logged only.
async fn reseed(gateway: Arc<Gateway>, original: JobId, source: Submission, dir: PathBuf) {
    if let Ok(status) = gateway.peek_status(&original, &["status", "seeder"]).await {
        if status.status == DownloadStatus::Active && status.seeder {
            debug!(gid = %original, "Torrent still seeding, no reseed needed");
            return;
        }
    }

    let mut gid = generate_gid();
    if let Err(e) = gateway.reseed(&source, &dir, &gid).await {
        warn!(gid = %original, error = %e, "Reseed failed");
        return;
    }
    info!(gid = %gid, original = %original, "Reseeding torrent");

    loop {
        tokio::time::sleep(RESEED_POLL).await;
        match gateway.peek_status(&gid, &["status", "followedBy"]).await {
            // a re-added magnet resolves its metadata first, then seeds under a new id
            Ok(status) if status.status == DownloadStatus::Complete && !status.followed_by.is_empty() => {
                let seeding = status.followed_by[0].clone();
                debug!(gid = %gid, seeding = %seeding, "Following reseed payload job");
                gid = seeding;
            }
            Ok(status) if status.status.is_terminal() => {
                info!(gid = %gid, status = ?status.status, "Reseed finished");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(gid = %gid, error = %e, "Reseed job no longer visible");
                return;
            }
        }
    }
}
