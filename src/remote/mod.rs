//! Remote store receiving uploaded files
//!
//! Uploads are resumable: a session is opened per file, chunks are pushed at
//! explicit offsets against an opaque cursor, and the final chunk yields the
//! remote file with its shareable link.

mod drive;
mod object;

pub use drive::{DriveStore, StaticToken, TokenSource};
pub use object::ObjectRemote;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::config::{StorageConfig, StorageProvider};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network failure, rate limiting, server-side hiccup
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Quota, permission, malformed request
    #[error("remote store rejected request: {0}")]
    Rejected(String),

    #[error("upload session {0} not found")]
    SessionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Metadata of a file about to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub mime_type: String,
    /// Remote folder id; `None` means the store's configured root
    pub parent: Option<String>,
    pub size: u64,
}

/// A file confirmed by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub link: String,
}

/// Store acknowledgement of one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Bytes persisted so far; the next chunk starts here
    Partial { received: u64 },
    Done(RemoteFile),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates a folder and returns its id
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, RemoteError>;

    fn folder_link(&self, folder_id: &str) -> String;

    /// Zero-length files are created in one call
    async fn create_empty(&self, meta: &FileMeta) -> Result<RemoteFile, RemoteError>;

    /// Starts a resumable session and returns its cursor
    async fn open_session(&self, meta: &FileMeta) -> Result<String, RemoteError>;

    async fn put_chunk(
        &self,
        cursor: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError>;

    /// Releases a session that will not be completed
    async fn abort_session(&self, cursor: &str) -> Result<(), RemoteError>;
}

/// Builds the configured backend
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    let store: Arc<dyn RemoteStore> = match config.provider {
        StorageProvider::Memory => Arc::new(ObjectRemote::in_memory()),
        StorageProvider::Local => Arc::new(ObjectRemote::local(config)?),
        StorageProvider::S3 => Arc::new(ObjectRemote::s3(config)?),
        StorageProvider::Drive => {
            let token = config
                .drive_token
                .clone()
                .ok_or_else(|| RemoteError::Rejected("drive access token missing".into()))?;
            Arc::new(DriveStore::new(Arc::new(StaticToken::new(token)))?)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Transient("503".into()).is_transient());
        assert!(!RemoteError::Rejected("quota".into()).is_transient());
        assert!(!RemoteError::SessionNotFound("x".into()).is_transient());
    }

    #[test]
    fn test_from_config_drive_requires_token() {
        let config = StorageConfig {
            provider: StorageProvider::Drive,
            ..StorageConfig::default()
        };
        assert!(matches!(from_config(&config), Err(RemoteError::Rejected(_))));
        assert!(from_config(&StorageConfig::default()).is_ok());
    }
}
