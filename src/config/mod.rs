//! Configuration management for mirrorbox
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use mirrorbox::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Daemon RPC port: {}", config.daemon.rpc_port);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `MIRRORBOX__<section>__<key>`
//!
//! Examples:
//! - `MIRRORBOX__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `MIRRORBOX__DAEMON__RPC_PORT=6900`
//! - `MIRRORBOX__STORAGE__CHUNK_SIZE=8MB`
//!
//! Secrets are read only from `MIRRORBOX_RPC_SECRET`, `MIRRORBOX_DRIVE_TOKEN`
//! and `S3_ACCESS_KEY`/`S3_SECRET_KEY` (or their `AWS_*` equivalents).
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/mirrorbox.toml`.
//! This can be overridden using the `MIRRORBOX_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, DaemonConfig, ReporterConfig, ServerConfig, ShutdownConfig, StorageConfig,
    StorageProvider,
};
pub use validation::{DRIVE_CHUNK_ALIGNMENT, ValidationError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or validation
    /// fails (incomplete TLS pair, misaligned chunk size, missing credentials).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[daemon]\nrpc_port = 6801\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.daemon.rpc_port, 6801);
        assert_eq!(config.storage.provider, StorageProvider::Memory);
    }

    #[test]
    fn test_validation_catches_half_tls_pair() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[daemon]
tls_certificate = "/etc/mirrorbox/cert.pem"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::IncompleteTlsPair)
        ));
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let config: Config = toml::from_str(include_str!("../../config/mirrorbox.toml")).unwrap();
        assert_eq!(config.storage.provider, StorageProvider::Local);
        assert_eq!(config.daemon.min_split_size.as_u64(), 10 * 1024 * 1024);
        assert!(validation::validate(&config).is_ok());
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "0.0.0.0:8088"

[daemon]
binary = "/usr/local/bin/aria2c"
rpc_port = 6800
download_dir = "/srv/downloads"
seed_ratio = 2.0
seed_time_minutes = 120
tls_certificate = "/etc/mirrorbox/cert.pem"
tls_private_key = "/etc/mirrorbox/key.pem"
tracker_list_url = "https://trackers.example/best.txt"

[storage]
provider = "local"
root = "/srv/mirror"
index_link = "https://index.example/mirror"
chunk_size = "16MB"
upload_workers = 8
max_retries = 3

[reporter]
tick_ms = 500
min_edit_interval_secs = 10

[shutdown]
reseed_grace_secs = 30
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8088");
        assert_eq!(config.daemon.seed_time_minutes, 120);
        assert!(config.daemon.tls_private_key.is_some());
        assert_eq!(config.storage.provider, StorageProvider::Local);
        assert_eq!(config.storage.upload_workers, 8);
        assert_eq!(config.reporter.tick().as_millis(), 500);
        assert_eq!(config.shutdown.reseed_grace().as_secs(), 30);
    }
}
