use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// HTTP command layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Download daemon launch options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_connection_per_server")]
    pub max_connection_per_server: u32,
    #[serde(default = "default_split")]
    pub split: u32,
    #[serde(default = "default_min_split_size")]
    pub min_split_size: ByteSize,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_max_upload_limit")]
    pub max_upload_limit: ByteSize,
    #[serde(default = "default_seed_ratio")]
    pub seed_ratio: f64,
    #[serde(default = "default_seed_time_minutes")]
    pub seed_time_minutes: u64,
    /// Used only when both files exist on disk
    pub tls_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,
    #[serde(default)]
    pub trackers: Vec<String>,
    /// Newline-separated tracker list fetched at launch
    pub tracker_list_url: Option<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// RPC secret (loaded from environment, not from config file)
    #[serde(skip)]
    pub rpc_secret: Option<String>,
}

impl DaemonConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            rpc_port: default_rpc_port(),
            download_dir: default_download_dir(),
            max_connection_per_server: default_max_connection_per_server(),
            split: default_split(),
            min_split_size: default_min_split_size(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_upload_limit: default_max_upload_limit(),
            seed_ratio: default_seed_ratio(),
            seed_time_minutes: default_seed_time_minutes(),
            tls_certificate: None,
            tls_private_key: None,
            trackers: Vec::new(),
            tracker_list_url: None,
            startup_timeout_secs: default_startup_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            rpc_secret: None,
        }
    }
}

fn default_binary() -> String {
    "aria2c".to_string()
}

fn default_rpc_port() -> u16 {
    6800
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_connection_per_server() -> u32 {
    10
}

fn default_split() -> u32 {
    10
}

fn default_min_split_size() -> ByteSize {
    ByteSize(10 * 1024 * 1024)
}

fn default_max_concurrent_downloads() -> u32 {
    5
}

fn default_max_upload_limit() -> ByteSize {
    ByteSize(5 * 1024)
}

fn default_seed_ratio() -> f64 {
    1.0
}

fn default_seed_time_minutes() -> u64 {
    60
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Storage provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Memory,
    Local,
    S3,
    Drive,
}

/// Remote store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    /// Remote parent folder id (Drive) or key prefix (object stores)
    pub parent_id: Option<String>,
    /// Public mirror index prefix
    pub index_link: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the local provider
    pub root: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Base URL prepended to object keys in result links
    pub public_url: Option<String>,
    /// S3 access key (loaded from environment, not from config file)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// S3 secret key (loaded from environment, not from config file)
    #[serde(skip)]
    pub secret_key: Option<String>,
    /// Drive OAuth access token (loaded from environment, not from config file)
    #[serde(skip)]
    pub drive_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            parent_id: None,
            index_link: None,
            chunk_size: default_chunk_size(),
            upload_workers: default_upload_workers(),
            max_retries: default_max_retries(),
            bucket: default_bucket(),
            root: None,
            endpoint: None,
            region: None,
            public_url: None,
            access_key: None,
            secret_key: None,
            drive_token: None,
        }
    }
}

fn default_chunk_size() -> ByteSize {
    ByteSize(50 * 1024 * 1024)
}

fn default_upload_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_bucket() -> String {
    "mirrorbox".to_string()
}

/// Progress reporter cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReporterConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_min_edit_interval_secs")]
    pub min_edit_interval_secs: u64,
}

impl ReporterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn min_edit_interval(&self) -> Duration {
        Duration::from_secs(self.min_edit_interval_secs)
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            min_edit_interval_secs: default_min_edit_interval_secs(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_min_edit_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// How long in-flight reseed tasks may run after shutdown starts
    #[serde(default = "default_reseed_grace_secs")]
    pub reseed_grace_secs: u64,
}

impl ShutdownConfig {
    pub fn reseed_grace(&self) -> Duration {
        Duration::from_secs(self.reseed_grace_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            reseed_grace_secs: default_reseed_grace_secs(),
        }
    }
}

fn default_reseed_grace_secs() -> u64 {
    10
}
