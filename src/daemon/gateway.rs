use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use super::process::DaemonProcess;
use super::{AddOptions, DaemonError, DaemonEvent, DaemonRpc, StatusSnapshot};
use crate::config::DaemonConfig;
use crate::error::TransferError;
use crate::retry::RetryPolicy;

/// What a caller hands to the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Uris(Vec<String>),
    /// Base64-encoded torrent metainfo
    Torrent(String),
}

impl Submission {
    /// URIs pass through unvalidated; only an empty set is rejected here
    pub fn uris<I, S>(uris: I) -> Result<Self, TransferError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let uris: Vec<String> = uris
            .into_iter()
            .map(Into::into)
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if uris.is_empty() {
            return Err(TransferError::InvalidInput("no URI to download".into()));
        }
        Ok(Submission::Uris(uris))
    }

    pub fn torrent_base64(blob: &str) -> Result<Self, TransferError> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|e| TransferError::InvalidInput(format!("torrent is not valid base64: {}", e)))?;
        check_metainfo(&bytes)?;
        Ok(Submission::Torrent(blob.trim().to_string()))
    }

    pub fn torrent_bytes(bytes: &[u8]) -> Result<Self, TransferError> {
        check_metainfo(bytes)?;
        Ok(Submission::Torrent(STANDARD.encode(bytes)))
    }

    pub fn is_torrent(&self) -> bool {
        matches!(self, Submission::Torrent(_))
            || matches!(self, Submission::Uris(uris) if uris.iter().any(|u| u.starts_with("magnet:")))
    }
}

/// Metainfo is a bencoded dictionary: `d ... e`
fn check_metainfo(bytes: &[u8]) -> Result<(), TransferError> {
    match (bytes.first(), bytes.last()) {
        (Some(b'd'), Some(b'e')) if bytes.len() > 2 => Ok(()),
        _ => Err(TransferError::InvalidInput(
            "torrent blob is not bencoded metainfo".into(),
        )),
    }
}

/// Narrow submission API over the download daemon
pub struct Gateway {
    rpc: Arc<dyn DaemonRpc>,
    process: Mutex<Option<DaemonProcess>>,
    status_retry: RetryPolicy,
}

impl Gateway {
    /// Wraps an already connected RPC channel
    pub fn new(rpc: Arc<dyn DaemonRpc>) -> Self {
        Self {
            rpc,
            process: Mutex::new(None),
            status_retry: RetryPolicy::default(),
        }
    }

    pub fn with_status_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    /// Starts the daemon, waits until it answers, and returns the gateway with
    /// the notification stream
    pub async fn launch(
        config: &DaemonConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DaemonEvent>), TransferError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut process = DaemonProcess::spawn(config).await.map_err(|e| {
            error!(error = %e, "Failed to start download daemon");
            TransferError::from(e)
        })?;

        let client = match process
            .wait_ready(
                config.rpc_secret.clone(),
                config.request_timeout(),
                config.startup_timeout(),
                &events_tx,
            )
            .await
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "Download daemon never became ready");
                process.terminate().await;
                return Err(TransferError::DaemonUnavailable(e.to_string()));
            }
        };

        let gateway = Self {
            rpc: Arc::new(client),
            process: Mutex::new(Some(process)),
            status_retry: RetryPolicy::default(),
        };
        Ok((gateway, events_rx))
    }

    pub async fn submit(
        &self,
        submission: &Submission,
        options: &AddOptions,
    ) -> Result<String, TransferError> {
        let gid = match submission {
            Submission::Uris(uris) if uris.is_empty() => {
                return Err(TransferError::InvalidInput("no URI to download".into()));
            }
            Submission::Uris(uris) => self.rpc.add_uri(uris, options).await?,
            Submission::Torrent(blob) => self.rpc.add_torrent(blob, options).await?,
        };
        info!(gid = %gid, torrent = submission.is_torrent(), "Submitted to download daemon");
        Ok(gid)
    }

    /// Re-adds a finished torrent so the daemon seeds it from `dir`
    pub async fn reseed(
        &self,
        source: &Submission,
        dir: &Path,
        gid: &str,
    ) -> Result<String, TransferError> {
        let options = AddOptions {
            gid: Some(gid.to_string()),
            dir: Some(dir.to_path_buf()),
            seed_only: true,
            check_integrity: true,
        };
        self.submit(source, &options).await
    }

    pub async fn pause(&self, gid: &str) -> Result<(), TransferError> {
        if self.is_gone(gid).await {
            return Ok(());
        }
        match self.rpc.pause(gid).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    pub async fn remove(&self, gid: &str) -> Result<(), TransferError> {
        self.remove_with(gid, false).await
    }

    pub async fn force_remove(&self, gid: &str) -> Result<(), TransferError> {
        self.remove_with(gid, true).await
    }

    async fn remove_with(&self, gid: &str, force: bool) -> Result<(), TransferError> {
        if self.is_gone(gid).await {
            debug!(gid, "Remove skipped, job already terminal");
            return Ok(());
        }
        match self.rpc.remove(gid, force).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    /// Force-removes each job, logging failures
    pub async fn force_remove_all(&self, gids: &[String]) {
        for gid in gids {
            match self.force_remove(gid).await {
                Ok(()) => info!(gid = %gid, "Removed payload job"),
                Err(e) => warn!(gid = %gid, error = %e, "Failed to remove payload job"),
            }
        }
    }

    /// Removes the payload jobs a metadata job was followed by
    pub async fn remove_successors(&self, gid: &str) {
        match self.rpc.tell_status(gid, &["followedBy"]).await {
            Ok(status) => self.force_remove_all(&status.followed_by).await,
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(gid, error = %e, "Could not read payload jobs of metadata job"),
        }
    }

    /// True when the daemon no longer knows the job or it reached a terminal state
    async fn is_gone(&self, gid: &str) -> bool {
        match self.rpc.tell_status(gid, &["status"]).await {
            Ok(status) => status.status.is_terminal(),
            Err(e) => e.is_not_found(),
        }
    }

    /// Status read retried with backoff while the daemon races ahead
    pub async fn status(&self, gid: &str, keys: &[&str]) -> Result<StatusSnapshot, TransferError> {
        self.status_retry
            .run(
                "daemon status",
                || self.rpc.tell_status(gid, keys),
                DaemonError::is_status_race,
            )
            .await
            .map_err(Into::into)
    }

    /// Single status read without retry, for the periodic poll
    pub async fn peek_status(&self, gid: &str, keys: &[&str]) -> Result<StatusSnapshot, DaemonError> {
        self.rpc.tell_status(gid, keys).await
    }

    /// Asks the daemon to exit, closes the channel, then reaps the child
    pub async fn close(&self) {
        if let Err(e) = self.rpc.shutdown().await {
            warn!(error = %e, "Download daemon shutdown request failed");
        }
        if let Some(mut process) = self.process.lock().await.take() {
            process.terminate().await;
        }
        info!("Download daemon gateway closed");
    }
}
