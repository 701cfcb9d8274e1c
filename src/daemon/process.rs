//! Daemon subprocess launch and readiness
//!
//! The daemon is started as a supervised child (no `--daemon` fork) so that it
//! is killed when the handle drops and its exit can be observed.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::rpc::Aria2Client;
use super::{DaemonError, DaemonEvent, DaemonRpc};
use crate::config::DaemonConfig;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed option set passed to the daemon binary
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    args: Vec<String>,
    tls: bool,
    port: u16,
}

impl LaunchOptions {
    /// `trackers` is the merged tracker list; TLS flags are added only when
    /// both files exist on disk
    pub fn new(config: &DaemonConfig, trackers: &[String]) -> Self {
        let mut args = vec![
            "--enable-rpc".to_string(),
            "--rpc-listen-all=false".to_string(),
            format!("--rpc-listen-port={}", config.rpc_port),
            format!("--dir={}", config.download_dir.display()),
            format!("--max-connection-per-server={}", config.max_connection_per_server),
            "--rpc-max-request-size=1024M".to_string(),
            format!("--seed-ratio={}", config.seed_ratio),
            format!("--seed-time={}", config.seed_time_minutes),
            format!("--max-upload-limit={}", config.max_upload_limit.as_u64()),
            format!("--max-concurrent-downloads={}", config.max_concurrent_downloads),
            format!("--min-split-size={}", config.min_split_size.as_u64()),
            "--follow-torrent=mem".to_string(),
            format!("--split={}", config.split),
            "--allow-overwrite=true".to_string(),
        ];

        if !trackers.is_empty() {
            args.push(format!("--bt-tracker={}", trackers.join(",")));
        }
        if let Some(secret) = &config.rpc_secret {
            args.push(format!("--rpc-secret={}", secret));
        }

        let tls = match (&config.tls_certificate, &config.tls_private_key) {
            (Some(cert), Some(key)) if cert.is_file() && key.is_file() => {
                args.push("--rpc-secure=true".to_string());
                args.push(format!("--rpc-certificate={}", cert.display()));
                args.push(format!("--rpc-private-key={}", key.display()));
                true
            }
            (Some(_), Some(_)) => {
                warn!("TLS certificate pair configured but not found on disk, using plain RPC");
                false
            }
            _ => false,
        };

        Self {
            args,
            tls,
            port: config.rpc_port,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn rpc_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://127.0.0.1:{}/jsonrpc", scheme, self.port)
    }
}

/// Merges configured trackers with the optional remote list, dropping duplicates
pub async fn resolve_trackers(config: &DaemonConfig) -> Vec<String> {
    let mut trackers = config.trackers.clone();
    if let Some(url) = &config.tracker_list_url {
        for tracker in fetch_trackers(url).await {
            if !trackers.contains(&tracker) {
                trackers.push(tracker);
            }
        }
    }
    trackers
}

/// Best-effort download of a newline-separated tracker list
pub async fn fetch_trackers(url: &str) -> Vec<String> {
    let body = match reqwest::get(url).await.and_then(|r| r.error_for_status()) {
        Ok(response) => response.text().await,
        Err(e) => Err(e),
    };

    match body {
        Ok(text) => {
            let trackers = parse_tracker_list(&text);
            debug!(url, count = trackers.len(), "Fetched tracker list");
            trackers
        }
        Err(e) => {
            warn!(url, error = %e, "Failed to fetch tracker list, using configured trackers");
            Vec::new()
        }
    }
}

fn parse_tracker_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Running daemon child process
pub struct DaemonProcess {
    child: Child,
    options: LaunchOptions,
}

impl DaemonProcess {
    /// Creates the download directory and starts the daemon binary
    pub async fn spawn(config: &DaemonConfig) -> Result<Self, DaemonError> {
        ensure_dir(&config.download_dir).await?;

        let trackers = resolve_trackers(config).await;
        let options = LaunchOptions::new(config, &trackers);

        let child = Command::new(&config.binary)
            .args(options.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DaemonError::Spawn(format!("daemon binary '{}' not found", config.binary))
                }
                _ => DaemonError::Spawn(format!("{}: {}", config.binary, e)),
            })?;

        info!(
            binary = %config.binary,
            port = config.rpc_port,
            trackers = trackers.len(),
            "Download daemon started"
        );

        Ok(Self { child, options })
    }

    pub fn rpc_url(&self) -> String {
        self.options.rpc_url()
    }

    /// Polls the RPC endpoint until `getVersion` answers or `timeout` passes
    pub async fn wait_ready(
        &mut self,
        secret: Option<String>,
        request_timeout: Duration,
        timeout: Duration,
        events: &mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Aria2Client, DaemonError> {
        let url = self.rpc_url();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.exit_status()? {
                return Err(DaemonError::Spawn(format!("daemon exited early with {}", status)));
            }

            match Aria2Client::connect(&url, secret.clone(), request_timeout, events.clone()).await
            {
                Ok(client) => match client.get_version().await {
                    Ok(version) => {
                        info!(version = %version, url = %url, "Download daemon ready");
                        return Ok(client);
                    }
                    Err(e) => debug!(error = %e, "Daemon not ready yet"),
                },
                Err(e) => debug!(error = %e, "Daemon not accepting connections yet"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DaemonError::Spawn(format!(
                    "daemon did not become ready within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn exit_status(&mut self) -> Result<Option<ExitStatus>, DaemonError> {
        self.child
            .try_wait()
            .map_err(|e| DaemonError::Spawn(e.to_string()))
    }

    /// Kills the child if it is still running and reaps it
    pub async fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "Failed to signal download daemon");
            return;
        }
        match tokio::time::timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Download daemon exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reap download daemon"),
            Err(_) => warn!("Download daemon did not exit in time"),
        }
    }
}

async fn ensure_dir(path: &Path) -> Result<(), DaemonError> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        DaemonError::Spawn(format!(
            "cannot create download directory {}: {}",
            path.display(),
            e
        ))
    })
}
