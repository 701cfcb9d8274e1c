//! Public facade and shutdown controller
//!
//! [`Mirror`] wires the gateway, registry, upload engine, orchestrator and
//! reporter together and exposes the operations the command layer needs.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::{Attachment, ChatClient, ChatId};
use crate::config::Config;
use crate::daemon::{AddOptions, DaemonEvent, Gateway, Submission, generate_gid};
use crate::error::TransferError;
use crate::observability::Metrics;
use crate::orchestrator::{Orchestrator, PipelineSettings, TransferOutcome};
use crate::registry::{JobId, JobKind, JobView, Registry, TransferJob};
use crate::remote::{self, RemoteStore};
use crate::reporter::Reporter;
use crate::retry::RetryPolicy;
use crate::upload::UploadEngine;

/// Backoff base for chunk and folder retries
const UPLOAD_RETRY_BASE: Duration = Duration::from_millis(500);

pub struct Mirror {
    gateway: Arc<Gateway>,
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    reporter: Arc<Reporter>,
    chat: Arc<dyn ChatClient>,
    metrics: Arc<Metrics>,
    download_dir: PathBuf,
    reseed_grace: Duration,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Mirror {
    /// Launches the download daemon and starts the pipeline. A daemon that
    /// fails to start is reported as [`TransferError::DaemonUnavailable`].
    pub async fn start(config: &Config, chat: Arc<dyn ChatClient>) -> Result<Arc<Self>, TransferError> {
        let remote = remote::from_config(&config.storage)
            .map_err(|e| TransferError::UploadFailed(format!("remote store unavailable: {}", e)))?;
        let (gateway, events) = Gateway::launch(&config.daemon).await?;
        info!(provider = ?config.storage.provider, "Transfer pipeline ready");
        Ok(Self::assemble(config, Arc::new(gateway), events, remote, chat))
    }

    /// Builds the pipeline around an existing gateway and event stream
    pub fn assemble(
        config: &Config,
        gateway: Arc<Gateway>,
        events: mpsc::UnboundedReceiver<DaemonEvent>,
        remote: Arc<dyn RemoteStore>,
        chat: Arc<dyn ChatClient>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(
            UploadEngine::new(
                remote,
                config.storage.chunk_size.as_u64(),
                RetryPolicy::new(config.storage.max_retries, UPLOAD_RETRY_BASE),
            )
            .with_metrics(metrics.clone()),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            gateway.clone(),
            registry.clone(),
            engine,
            chat.clone(),
            metrics.clone(),
            PipelineSettings::from_config(&config.storage),
        ));

        let shutdown = CancellationToken::new();
        let reporter = Arc::new(Reporter::new(
            registry.clone(),
            gateway.clone(),
            orchestrator.clone(),
            chat.clone(),
            &config.reporter,
            shutdown.child_token(),
        ));
        let event_loop = tokio::spawn(orchestrator.clone().run(events, shutdown.child_token()));

        Arc::new(Self {
            gateway,
            registry,
            orchestrator,
            reporter,
            chat,
            metrics,
            download_dir: config.daemon.download_dir.clone(),
            reseed_grace: config.shutdown.reseed_grace(),
            shutdown,
            stopped: AtomicBool::new(false),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransferError::DaemonUnavailable("pipeline is shutting down".into()));
        }
        Ok(())
    }

    /// Hands a submission to the daemon. The job is registered under a
    /// pre-generated gid before the daemon sees it, so its notifications
    /// always find the job.
    pub async fn submit(&self, chat: ChatId, submission: Submission) -> Result<JobId, TransferError> {
        self.ensure_open()?;
        let kind = match submission {
            Submission::Uris(_) => JobKind::Uri,
            Submission::Torrent(_) => JobKind::TorrentBlob,
        };
        self.submit_as(chat, submission, kind, None).await
    }

    pub async fn submit_uris<I, S>(&self, chat: ChatId, uris: I) -> Result<JobId, TransferError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(chat, Submission::uris(uris)?).await
    }

    pub async fn submit_torrent(&self, chat: ChatId, metainfo: &[u8]) -> Result<JobId, TransferError> {
        self.submit(chat, Submission::torrent_bytes(metainfo)?).await
    }

    async fn submit_as(
        &self,
        chat: ChatId,
        submission: Submission,
        kind: JobKind,
        name: Option<String>,
    ) -> Result<JobId, TransferError> {
        let gid = generate_gid();
        let name = name.unwrap_or_else(|| initial_name(&submission));
        self.registry
            .insert(TransferJob::new(gid.clone(), kind, chat, name).with_source(submission.clone()));

        let options = AddOptions {
            gid: Some(gid.clone()),
            ..AddOptions::default()
        };
        if let Err(e) = self.gateway.submit(&submission, &options).await {
            self.registry.take(&gid);
            warn!(gid = %gid, error = %e, "Daemon refused submission");
            return Err(e);
        }

        self.metrics.job_submitted();
        self.reporter.ensure_running();
        Ok(gid)
    }

    /// Torrent attachments go through the daemon; any other attachment is
    /// uploaded directly
    pub async fn submit_attachment(
        &self,
        chat: ChatId,
        attachment: &Attachment,
    ) -> Result<JobId, TransferError> {
        self.ensure_open()?;
        let dir = self.download_dir.join("attachments").join(uuid::Uuid::new_v4().to_string());
        let path = self.chat.download_attachment(attachment, &dir).await?;

        if attachment.is_torrent() {
            let metainfo = tokio::fs::read(&path)
                .await
                .map_err(|e| TransferError::InvalidInput(format!("{}: {}", path.display(), e)))?;
            let submission = Submission::torrent_bytes(&metainfo)?;
            return self
                .submit_as(chat, submission, JobKind::TorrentBlob, Some(attachment.file_name.clone()))
                .await;
        }

        let job_id = generate_gid();
        self.registry.insert(TransferJob::new(
            job_id.clone(),
            JobKind::ChatAttachment,
            chat,
            attachment.file_name.clone(),
        ));
        self.metrics.job_submitted();
        self.orchestrator.upload_local(job_id.clone(), path);
        self.reporter.ensure_running();
        info!(job_id = %job_id, file = %attachment.file_name, "Attachment queued for upload");
        Ok(job_id)
    }

    /// Requests abort; a no-op for ids the registry does not know
    pub fn cancel(&self, job_id: &str) {
        self.registry.cancel(job_id);
        self.reporter.ensure_running();
    }

    pub async fn pause(&self, job_id: &str) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.gateway.pause(job_id).await
    }

    /// Asks the daemon to stop the download; the stop notification removes the job
    pub async fn remove(&self, job_id: &str) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.gateway.remove(job_id).await
    }

    pub async fn force_remove(&self, job_id: &str) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.gateway.force_remove(job_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferOutcome> {
        self.orchestrator.subscribe()
    }

    pub fn jobs(&self) -> Vec<JobView> {
        self.registry.views()
    }

    pub fn job(&self, job_id: &str) -> Option<JobView> {
        self.registry.get(job_id)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn pending_reseeds(&self) -> usize {
        self.orchestrator.pending_reseeds()
    }

    /// Stops the reporter, drops every job, closes the daemon, then gives
    /// reseed tasks the grace period
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down transfer pipeline");
        self.shutdown.cancel();
        self.reporter.join().await;
        if let Some(handle) = self.event_loop.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Orchestrator event loop failed");
            }
        }

        let dropped = self.registry.cancel_all();
        if !dropped.is_empty() {
            info!(jobs = dropped.len(), "Dropped unfinished transfers");
        }
        self.orchestrator.release_idle_bindings().await;

        self.gateway.close().await;
        self.orchestrator.drain(self.reseed_grace).await;
        info!("Transfer pipeline stopped");
    }
}

/// Provisional display name until the daemon reports one
fn initial_name(submission: &Submission) -> String {
    match submission {
        Submission::Uris(uris) => uris
            .first()
            .map(|uri| {
                if uri.starts_with("magnet:") {
                    magnet_name(uri).unwrap_or_else(|| "magnet".to_string())
                } else {
                    uri.split(['?', '#'])
                        .next()
                        .and_then(|u| u.rsplit('/').find(|s| !s.is_empty()))
                        .unwrap_or(uri.as_str())
                        .to_string()
                }
            })
            .unwrap_or_default(),
        Submission::Torrent(_) => "torrent".to_string(),
    }
}

/// `dn` parameter of a magnet link
fn magnet_name(uri: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dn="))
        .map(|name| {
            percent_encoding::percent_decode_str(&name.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned()
        })
}
