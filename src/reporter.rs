//! Progress Reporter
//!
//! One loop for the whole process, started by the first submission. Each tick
//! consumes the cancel set, refreshes downloading jobs from the daemon, and
//! edits every chat's status message when its rendered text changed and the
//! minimum edit interval has passed. The loop exits once nothing is left to
//! report and is restarted by the next submission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatClient, ChatError, ChatId};
use crate::config::ReporterConfig;
use crate::daemon::{DaemonEvent, DownloadStatus, Gateway, StatusSnapshot};
use crate::humanize::{self, ByteSize};
use crate::orchestrator::Orchestrator;
use crate::registry::{JobKind, JobPhase, JobView, Registry, StatusBinding};

pub struct Reporter {
    registry: Arc<Registry>,
    gateway: Arc<Gateway>,
    orchestrator: Arc<Orchestrator>,
    chat: Arc<dyn ChatClient>,
    tick_interval: Duration,
    min_edit_interval: Duration,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Reporter {
    pub fn new(
        registry: Arc<Registry>,
        gateway: Arc<Gateway>,
        orchestrator: Arc<Orchestrator>,
        chat: Arc<dyn ChatClient>,
        config: &ReporterConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            gateway,
            orchestrator,
            chat,
            tick_interval: config.tick(),
            min_edit_interval: config.min_edit_interval(),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the loop unless it is already running
    pub fn ensure_running(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("Progress reporter started");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;

            if self.is_idle() {
                self.running.store(false, Ordering::SeqCst);
                // A submission may have slipped in after the idle check
                if self.is_idle() || self.running.swap(true, Ordering::SeqCst) {
                    debug!("Progress reporter idle, stopping");
                    return;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("Progress reporter stopped");
    }

    fn is_idle(&self) -> bool {
        self.registry.is_empty()
            && self.registry.binding_count() == 0
            && self.registry.pending_cancellations() == 0
    }

    /// Waits for the loop to exit after the shutdown token fired
    pub async fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress reporter task failed");
            }
        }
    }

    /// One reporting pass
    pub async fn tick(&self) {
        self.reconcile().await;
        self.poll().await;
        for (chat, views) in self.registry.views_by_chat() {
            self.report(chat, &render_status(&views)).await;
        }
        self.orchestrator.release_idle_bindings().await;
    }

    async fn reconcile(&self) {
        for job in self.registry.reconcile_cancellations() {
            info!(job_id = %job.job_id, name = %job.name, "Transfer cancelled");
            if job.kind != JobKind::ChatAttachment {
                if let Err(e) = self.gateway.force_remove(&job.job_id).await {
                    warn!(job_id = %job.job_id, error = %e, "Failed to remove cancelled download");
                }
                // resolved metadata keeps running as its payload job
                if job.is_metadata {
                    self.gateway.remove_successors(&job.job_id).await;
                }
            }
            self.orchestrator.cancelled(job).await;
        }
    }

    /// Refreshes counters and recovers terminal states whose notification
    /// was missed or raced ahead of the submission
    async fn poll(&self) {
        for gid in self.registry.downloading_ids() {
            let snapshot = match self.gateway.peek_status(&gid, StatusSnapshot::PROGRESS_KEYS).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!(gid = %gid, error = %e, "Status poll failed");
                    continue;
                }
            };
            if !self.registry.apply_snapshot(&gid, &snapshot) {
                continue;
            }
            let event = match snapshot.status {
                DownloadStatus::Complete => DaemonEvent::Complete(gid),
                DownloadStatus::Error => DaemonEvent::Error(gid),
                DownloadStatus::Removed => DaemonEvent::Stop(gid),
                _ => continue,
            };
            debug!(event = ?event, "Dispatching terminal state seen by the poll");
            self.orchestrator.handle(event).await;
        }
    }

    async fn report(&self, chat: ChatId, text: &str) {
        let Some(binding) = self.registry.binding(chat) else {
            // the chat's last job may have finished since the views were taken
            if !self.registry.has_jobs(chat) {
                return;
            }
            match self.chat.send_message(chat, text).await {
                Ok(message_id) => self.registry.set_binding(
                    chat,
                    StatusBinding {
                        message_id,
                        last_text: text.to_string(),
                        last_edit: Instant::now(),
                    },
                ),
                Err(e) => warn!(chat, error = %e, "Failed to send status message"),
            }
            return;
        };

        if binding.last_text == text || binding.last_edit.elapsed() < self.min_edit_interval {
            return;
        }
        match self.chat.edit_message(chat, binding.message_id, text).await {
            Ok(()) | Err(ChatError::Unchanged) => {
                self.registry.touch_binding(chat, binding.message_id, text);
            }
            Err(ChatError::NotFound(id)) => {
                debug!(chat, message_id = id, "Status message vanished, sending a new one");
                self.registry.clear_binding(chat, id);
            }
            Err(e) => warn!(chat, error = %e, "Failed to edit status message"),
        }
    }
}

/// Combined status block for one chat's jobs
pub fn render_status(views: &[JobView]) -> String {
    views
        .iter()
        .map(render_job)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_job(view: &JobView) -> String {
    match (view.phase, &view.upload) {
        (JobPhase::Uploading, Some(upload)) => {
            let mut text = format!(
                "`{}`\nStatus: **Uploading** {}/{} files",
                view.name, upload.files_done, upload.files_total
            );
            for task in upload.active.values() {
                let snapshot = &task.snapshot;
                text.push_str(&format!(
                    "\n`{}`\nProgress: [{}] {}%\n__{} of {} @ {}__\neta - {}",
                    task.name,
                    humanize::progress_bar(snapshot.fraction()),
                    percent(snapshot.fraction()),
                    ByteSize(snapshot.bytes_uploaded),
                    ByteSize(snapshot.total_bytes),
                    humanize::speed(snapshot.speed),
                    humanize::eta(snapshot.eta),
                ));
            }
            text
        }
        (JobPhase::Downloading, _) => {
            let status = if view.is_metadata {
                "Fetching metadata"
            } else {
                view.status.label()
            };
            let fraction = humanize::fraction(view.completed_length, view.total_length);
            let eta = humanize::estimate_remaining(
                view.total_length.saturating_sub(view.completed_length),
                view.download_speed as f64,
            );
            format!(
                "`{}`\nStatus: **{}**\nProgress: [{}] {}%\n__{} of {} @ {}__\neta - {}",
                view.name,
                status,
                humanize::progress_bar(fraction),
                percent(fraction),
                ByteSize(view.completed_length),
                ByteSize(view.total_length),
                humanize::speed(view.download_speed as f64),
                humanize::eta(eta),
            )
        }
        _ => format!("`{}`\nStatus: **Processing**", view.name),
    }
}

fn percent(fraction: f64) -> u64 {
    (fraction * 100.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{TransferJob, UploadProgress, UploadState};
    use crate::upload::ProgressSnapshot;
    use std::collections::BTreeMap;

    fn downloading() -> JobView {
        let mut job = TransferJob::new("g1", JobKind::Uri, 1, "ubuntu.iso");
        job.status = DownloadStatus::Active;
        job.total_length = 1000;
        job.completed_length = 460;
        job.download_speed = 108;
        job.view()
    }

    #[test]
    fn test_render_download_block() {
        assert_eq!(
            render_job(&downloading()),
            "`ubuntu.iso`\nStatus: **Downloading**\nProgress: [●●●●●○○○○○] 46%\n__460B of 1000B @ 108B/s__\neta - 5s"
        );
    }

    #[test]
    fn test_render_zero_speed_has_unknown_eta() {
        let mut view = downloading();
        view.download_speed = 0;
        assert!(render_job(&view).ends_with("eta - unknown"));
    }

    #[test]
    fn test_render_upload_block() {
        let mut view = downloading();
        view.phase = JobPhase::Uploading;
        let mut active = BTreeMap::new();
        active.insert(
            "CD1/01.flac".to_string(),
            UploadProgress {
                name: "01.flac".into(),
                snapshot: ProgressSnapshot {
                    bytes_uploaded: 2048,
                    total_bytes: 4096,
                    speed: 1024.0,
                    eta: Some(Duration::from_secs(2)),
                },
            },
        );
        view.upload = Some(UploadState {
            files_done: 1,
            files_total: 3,
            active,
        });

        let text = render_job(&view);
        assert!(text.starts_with("`ubuntu.iso`\nStatus: **Uploading** 1/3 files"));
        assert!(text.contains("`01.flac`\nProgress: [●●●●●○○○○○] 50%\n__2KB of 4KB @ 1KB/s__\neta - 2s"));
    }

    #[test]
    fn test_render_combines_jobs() {
        let mut resolving = downloading();
        resolving.phase = JobPhase::Resolving;
        resolving.name = "album".into();
        let text = render_status(&[downloading(), resolving]);
        assert!(text.contains("\n\n`album`\nStatus: **Processing**"));
    }
}
