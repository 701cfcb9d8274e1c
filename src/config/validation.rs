use super::models::{Config, StorageProvider};
use thiserror::Error;

/// Resumable upload granularity required by the Drive API
pub const DRIVE_CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// Lower bound for edits to one status message
pub const MIN_EDIT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("TLS certificate and private key must be configured together")]
    IncompleteTlsPair,

    #[error("daemon rpc_port must be non-zero")]
    InvalidRpcPort,

    #[error("chunk_size ({actual}) must be at least {minimum} bytes")]
    ChunkSizeTooSmall { actual: u64, minimum: u64 },

    #[error("chunk_size ({actual}) must be a multiple of {alignment} bytes for Drive uploads")]
    ChunkSizeMisaligned { actual: u64, alignment: u64 },

    #[error("upload_workers must be at least 1")]
    NoUploadWorkers,

    #[error("min_edit_interval_secs ({actual}) must be at least {minimum}")]
    EditIntervalTooShort { actual: u64, minimum: u64 },

    #[error("reporter tick_ms must be positive")]
    InvalidTick,

    #[error("Storage provider is S3 but missing credentials (access_key or secret_key)")]
    MissingS3Credentials,

    #[error("Storage provider is drive but MIRRORBOX_DRIVE_TOKEN is not set")]
    MissingDriveToken,

    #[error("Storage provider is local but no root directory is configured")]
    MissingLocalRoot,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_daemon(config)?;
    validate_storage(config)?;
    validate_reporter(config)?;
    Ok(())
}

fn validate_daemon(config: &Config) -> Result<(), ValidationError> {
    let daemon = &config.daemon;
    if daemon.rpc_port == 0 {
        return Err(ValidationError::InvalidRpcPort);
    }
    if daemon.tls_certificate.is_some() != daemon.tls_private_key.is_some() {
        return Err(ValidationError::IncompleteTlsPair);
    }
    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    let storage = &config.storage;
    let chunk = storage.chunk_size.as_u64();

    if chunk < DRIVE_CHUNK_ALIGNMENT {
        return Err(ValidationError::ChunkSizeTooSmall {
            actual: chunk,
            minimum: DRIVE_CHUNK_ALIGNMENT,
        });
    }
    if storage.upload_workers == 0 {
        return Err(ValidationError::NoUploadWorkers);
    }

    match storage.provider {
        StorageProvider::S3 => {
            if storage.access_key.is_none() || storage.secret_key.is_none() {
                return Err(ValidationError::MissingS3Credentials);
            }
        }
        StorageProvider::Drive => {
            if chunk % DRIVE_CHUNK_ALIGNMENT != 0 {
                return Err(ValidationError::ChunkSizeMisaligned {
                    actual: chunk,
                    alignment: DRIVE_CHUNK_ALIGNMENT,
                });
            }
            if storage.drive_token.is_none() {
                return Err(ValidationError::MissingDriveToken);
            }
        }
        StorageProvider::Local => {
            if storage.root.is_none() {
                return Err(ValidationError::MissingLocalRoot);
            }
        }
        StorageProvider::Memory => {}
    }

    Ok(())
}

fn validate_reporter(config: &Config) -> Result<(), ValidationError> {
    let reporter = &config.reporter;
    if reporter.tick_ms == 0 {
        return Err(ValidationError::InvalidTick);
    }
    if reporter.min_edit_interval_secs < MIN_EDIT_INTERVAL_SECS {
        return Err(ValidationError::EditIntervalTooShort {
            actual: reporter.min_edit_interval_secs,
            minimum: MIN_EDIT_INTERVAL_SECS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_tls_pair_must_be_complete() {
        let mut config = Config::default();
        config.daemon.tls_certificate = Some(PathBuf::from("cert.pem"));
        assert!(matches!(
            validate(&config),
            Err(ValidationError::IncompleteTlsPair)
        ));

        config.daemon.tls_private_key = Some(PathBuf::from("key.pem"));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_rpc_port_zero_rejected() {
        let mut config = Config::default();
        config.daemon.rpc_port = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidRpcPort)));
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = Config::default();
        config.storage.chunk_size = ByteSize(1024);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ChunkSizeTooSmall { .. })
        ));

        config.storage.chunk_size = ByteSize(300 * 1024);
        assert!(validate(&config).is_ok());

        config.storage.provider = StorageProvider::Drive;
        config.storage.drive_token = Some("token".into());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ChunkSizeMisaligned { .. })
        ));

        config.storage.chunk_size = ByteSize(512 * 1024);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_provider_credentials() {
        let mut config = Config::default();
        config.storage.provider = StorageProvider::S3;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingS3Credentials)
        ));

        config.storage.provider = StorageProvider::Drive;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingDriveToken)
        ));

        config.storage.provider = StorageProvider::Local;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::MissingLocalRoot)
        ));
    }

    #[test]
    fn test_edit_interval_floor() {
        let mut config = Config::default();
        config.reporter.min_edit_interval_secs = 1;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::EditIntervalTooShort { .. })
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.storage.upload_workers = 0;
        assert!(matches!(validate(&config), Err(ValidationError::NoUploadWorkers)));
    }
}
