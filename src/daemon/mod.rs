//! Download-daemon gateway (aria2 over JSON-RPC/WebSocket)
//!
//! - [`DaemonRpc`] - narrow async interface of the daemon's RPC surface
//! - [`rpc::Aria2Client`] - websocket implementation with notification pump
//! - [`process::DaemonProcess`] - launches the daemon with a fixed option set
//! - [`Gateway`] - submission API, status reads with backoff, lifecycle
//! - [`StatusSnapshot`] - typed status decoded once at the RPC boundary

mod gateway;
pub mod process;
pub mod rpc;
mod status;

pub use gateway::{Gateway, Submission};
pub use status::{BitTorrentInfo, DownloadStatus, FileEntry, StatusSnapshot, TorrentInfoName, UriEntry};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("GID {0} is not found")]
    NotFound(String),

    #[error("daemon rejected request ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed daemon response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("daemon transport error: {0}")]
    Transport(String),

    #[error("failed to launch daemon: {0}")]
    Spawn(String),

    #[error("daemon request timed out")]
    Timeout,

    #[error("daemon connection closed")]
    Closed,
}

impl DaemonError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DaemonError::NotFound(_))
    }

    /// Status reads race the daemon; these conditions are worth another try
    pub fn is_status_race(&self) -> bool {
        matches!(self, DaemonError::NotFound(_) | DaemonError::Timeout)
    }
}

/// Asynchronous notification redispatched from the daemon, keyed by gid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Start(String),
    Complete(String),
    BtComplete(String),
    Error(String),
    Stop(String),
}

impl DaemonEvent {
    /// Notification methods the gateway subscribes to
    pub const METHODS: [&'static str; 5] = [
        "aria2.onDownloadStart",
        "aria2.onDownloadComplete",
        "aria2.onBtDownloadComplete",
        "aria2.onDownloadError",
        "aria2.onDownloadStop",
    ];

    pub fn from_notification(method: &str, gid: String) -> Option<Self> {
        match method {
            "aria2.onDownloadStart" => Some(DaemonEvent::Start(gid)),
            "aria2.onDownloadComplete" => Some(DaemonEvent::Complete(gid)),
            "aria2.onBtDownloadComplete" => Some(DaemonEvent::BtComplete(gid)),
            "aria2.onDownloadError" => Some(DaemonEvent::Error(gid)),
            "aria2.onDownloadStop" => Some(DaemonEvent::Stop(gid)),
            _ => None,
        }
    }

    pub fn gid(&self) -> &str {
        match self {
            DaemonEvent::Start(gid)
            | DaemonEvent::Complete(gid)
            | DaemonEvent::BtComplete(gid)
            | DaemonEvent::Error(gid)
            | DaemonEvent::Stop(gid) => gid,
        }
    }
}

/// Per-download options passed with `addUri` / `addTorrent`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOptions {
    /// Caller-chosen gid (16 hex characters)
    pub gid: Option<String>,
    pub dir: Option<PathBuf>,
    pub seed_only: bool,
    pub check_integrity: bool,
}

impl AddOptions {
    pub fn to_value(&self) -> Value {
        let mut options = Map::new();
        if let Some(gid) = &self.gid {
            options.insert("gid".into(), Value::String(gid.clone()));
        }
        if let Some(dir) = &self.dir {
            options.insert("dir".into(), Value::String(dir.to_string_lossy().into_owned()));
        }
        if self.seed_only {
            options.insert("seed-only".into(), Value::String("true".into()));
        }
        if self.check_integrity {
            options.insert("check-integrity".into(), Value::String("true".into()));
        }
        Value::Object(options)
    }
}

/// RPC surface of the download daemon consumed by the gateway
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn add_uri(&self, uris: &[String], options: &AddOptions) -> Result<String, DaemonError>;

    /// `torrent` is the base64-encoded metainfo
    async fn add_torrent(&self, torrent: &str, options: &AddOptions) -> Result<String, DaemonError>;

    /// Empty `keys` requests every field
    async fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<StatusSnapshot, DaemonError>;

    async fn pause(&self, gid: &str) -> Result<(), DaemonError>;

    async fn remove(&self, gid: &str, force: bool) -> Result<(), DaemonError>;

    async fn get_version(&self) -> Result<String, DaemonError>;

    /// Asks the daemon to exit and tears down the channel
    async fn shutdown(&self) -> Result<(), DaemonError>;
}

/// 16 hex characters, the gid format the daemon accepts from callers
pub fn generate_gid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_mapping() {
        for method in DaemonEvent::METHODS {
            let event = DaemonEvent::from_notification(method, "abc".into()).unwrap();
            assert_eq!(event.gid(), "abc");
        }
        assert_eq!(
            DaemonEvent::from_notification("aria2.onBtDownloadComplete", "g".into()),
            Some(DaemonEvent::BtComplete("g".into()))
        );
        assert!(DaemonEvent::from_notification("aria2.onDownloadPause", "g".into()).is_none());
    }

    #[test]
    fn test_add_options_to_value() {
        let options = AddOptions {
            gid: Some("0123456789abcdef".into()),
            dir: Some(PathBuf::from("/data/downloads")),
            seed_only: true,
            check_integrity: true,
        };
        let value = options.to_value();
        assert_eq!(value["gid"], "0123456789abcdef");
        assert_eq!(value["dir"], "/data/downloads");
        assert_eq!(value["seed-only"], "true");
        assert_eq!(value["check-integrity"], "true");

        assert_eq!(AddOptions::default().to_value(), Value::Object(Map::new()));
    }

    #[test]
    fn test_generated_gid_shape() {
        let gid = generate_gid();
        assert_eq!(gid.len(), 16);
        assert!(gid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(gid, generate_gid());
    }

    #[test]
    fn test_status_race_classification() {
        assert!(DaemonError::NotFound("x".into()).is_status_race());
        assert!(DaemonError::Timeout.is_status_race());
        assert!(!DaemonError::Closed.is_status_race());
    }
}
