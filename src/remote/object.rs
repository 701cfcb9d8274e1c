//! object_store backend (in-memory, local filesystem, S3)
//!
//! Folder ids are key prefixes marked by an empty `.keep` object. Resumable
//! sessions map onto multipart uploads, one part per chunk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{MultipartUpload, ObjectStore, PutPayload, path::Path as StoragePath};
use tracing::{debug, info, warn};

use super::{ChunkAck, FileMeta, RemoteError, RemoteFile, RemoteStore};
use crate::config::StorageConfig;

const FOLDER_MARKER: &str = ".keep";

struct Session {
    upload: Box<dyn MultipartUpload>,
    key: String,
    name: String,
    received: u64,
}

/// Remote store over any object_store backend
pub struct ObjectRemote {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    scheme: &'static str,
    public_url: Option<String>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl From<object_store::Error> for RemoteError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
                RemoteError::Transient(err.to_string())
            }
            other => RemoteError::Rejected(other.to_string()),
        }
    }
}

impl ObjectRemote {
    /// Create remote with any object_store backend
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String, scheme: &'static str) -> Self {
        Self {
            store,
            bucket,
            scheme,
            public_url: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_public_url(mut self, public_url: Option<String>) -> Self {
        self.public_url = public_url;
        self
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "mirrorbox".to_string(), "memory")
    }

    pub fn local(config: &StorageConfig) -> Result<Self, RemoteError> {
        let root = config
            .root
            .as_ref()
            .ok_or_else(|| RemoteError::Rejected("local storage root not configured".into()))?;
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), config.bucket.clone(), "file")
            .with_public_url(config.public_url.clone()))
    }

    pub fn s3(config: &StorageConfig) -> Result<Self, RemoteError> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if let (Some(access), Some(secret)) = (&config.access_key, &config.secret_key) {
            builder = builder
                .with_access_key_id(access)
                .with_secret_access_key(secret);
        }
        let store = builder.build()?;
        Ok(Self::new(Arc::new(store), config.bucket.clone(), "s3")
            .with_public_url(config.public_url.clone()))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_for(name: &str, parent: Option<&str>) -> String {
        match parent.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(parent) => format!("{}/{}", parent, name),
            None => name.to_string(),
        }
    }

    fn link_for(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("{}://{}/{}", self.scheme, self.bucket, key),
        }
    }

    /// Download an object (used to verify uploads)
    pub async fn download(&self, key: &str) -> Result<Bytes, RemoteError> {
        let path = StoragePath::from(key);
        let bytes = self.store.get(&path).await?.bytes().await?;
        debug!(key, size = bytes.len(), "Downloaded from storage");
        Ok(bytes)
    }

    /// Check if key exists
    pub async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }
}

#[async_trait]
impl RemoteStore for ObjectRemote {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, RemoteError> {
        let key = Self::key_for(name, parent);
        let marker = StoragePath::from(format!("{}/{}", key, FOLDER_MARKER));
        self.store.put(&marker, PutPayload::new()).await?;
        debug!(folder = %key, "Created folder marker");
        Ok(key)
    }

    fn folder_link(&self, folder_id: &str) -> String {
        self.link_for(&format!("{}/", folder_id))
    }

    async fn create_empty(&self, meta: &FileMeta) -> Result<RemoteFile, RemoteError> {
        let key = Self::key_for(&meta.name, meta.parent.as_deref());
        self.store
            .put(&StoragePath::from(key.as_str()), PutPayload::new())
            .await?;
        info!(key = %key, "Uploaded empty file");
        Ok(RemoteFile {
            link: self.link_for(&key),
            id: key,
            name: meta.name.clone(),
            size: 0,
        })
    }

    async fn open_session(&self, meta: &FileMeta) -> Result<String, RemoteError> {
        let key = Self::key_for(&meta.name, meta.parent.as_deref());
        let upload = self
            .store
            .put_multipart(&StoragePath::from(key.as_str()))
            .await?;
        let cursor = uuid::Uuid::new_v4().to_string();
        self.sessions().insert(
            cursor.clone(),
            Session {
                upload,
                key,
                name: meta.name.clone(),
                received: 0,
            },
        );
        Ok(cursor)
    }

    async fn put_chunk(
        &self,
        cursor: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError> {
        // The session leaves the map while this chunk is in flight
        let mut session = self
            .sessions()
            .remove(cursor)
            .ok_or_else(|| RemoteError::SessionNotFound(cursor.to_string()))?;

        if offset != session.received {
            let received = session.received;
            self.sessions().insert(cursor.to_string(), session);
            return Err(RemoteError::Rejected(format!(
                "chunk offset {} does not match received {}",
                offset, received
            )));
        }

        let len = data.len() as u64;
        if let Err(e) = session.upload.put_part(PutPayload::from(data)).await {
            self.sessions().insert(cursor.to_string(), session);
            return Err(e.into());
        }
        session.received += len;

        if session.received < total {
            let received = session.received;
            self.sessions().insert(cursor.to_string(), session);
            return Ok(ChunkAck::Partial { received });
        }

        if let Err(e) = session.upload.complete().await {
            let _ = session.upload.abort().await;
            return Err(e.into());
        }
        info!(key = %session.key, size = session.received, "Uploaded to storage");
        Ok(ChunkAck::Done(RemoteFile {
            link: self.link_for(&session.key),
            id: session.key,
            name: session.name,
            size: session.received,
        }))
    }

    async fn abort_session(&self, cursor: &str) -> Result<(), RemoteError> {
        let Some(mut session) = self.sessions().remove(cursor) else {
            return Ok(());
        };
        if let Err(e) = session.upload.abort().await {
            warn!(key = %session.key, error = %e, "Failed to abort multipart upload");
            return Err(e.into());
        }
        debug!(key = %session.key, "Aborted upload session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, parent: Option<&str>, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            mime_type: "application/octet-stream".into(),
            parent: parent.map(str::to_string),
            size,
        }
    }

    #[tokio::test]
    async fn test_chunked_upload_round_trip() {
        let remote = ObjectRemote::in_memory();
        let cursor = remote.open_session(&meta("a.bin", Some("mirror"), 6)).await.unwrap();

        let ack = remote
            .put_chunk(&cursor, 0, Bytes::from_static(b"abc"), 6)
            .await
            .unwrap();
        assert_eq!(ack, ChunkAck::Partial { received: 3 });

        let ack = remote
            .put_chunk(&cursor, 3, Bytes::from_static(b"def"), 6)
            .await
            .unwrap();
        let ChunkAck::Done(file) = ack else {
            panic!("expected final ack");
        };
        assert_eq!(file.id, "mirror/a.bin");
        assert_eq!(file.size, 6);
        assert_eq!(file.link, "memory://mirrorbox/mirror/a.bin");
        assert_eq!(remote.download("mirror/a.bin").await.unwrap().as_ref(), b"abcdef");
        assert_eq!(remote.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_offset_mismatch_rejected() {
        let remote = ObjectRemote::in_memory();
        let cursor = remote.open_session(&meta("b.bin", None, 10)).await.unwrap();

        let err = remote
            .put_chunk(&cursor, 4, Bytes::from_static(b"xyz"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
        assert_eq!(remote.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_folder_and_empty_file() {
        let remote = ObjectRemote::in_memory()
            .with_public_url(Some("https://cdn.example/files/".into()));

        let folder = remote.create_folder("Album", Some("root")).await.unwrap();
        assert_eq!(folder, "root/Album");
        assert!(remote.exists("root/Album/.keep").await.unwrap());
        assert_eq!(remote.folder_link(&folder), "https://cdn.example/files/root/Album/");

        let file = remote.create_empty(&meta("empty.txt", Some(&folder), 0)).await.unwrap();
        assert_eq!(file.size, 0);
        assert_eq!(file.link, "https://cdn.example/files/root/Album/empty.txt");
        assert!(remote.exists("root/Album/empty.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_releases_session() {
        let remote = ObjectRemote::in_memory();
        let cursor = remote.open_session(&meta("c.bin", None, 10)).await.unwrap();
        remote
            .put_chunk(&cursor, 0, Bytes::from_static(b"12345"), 10)
            .await
            .unwrap();

        remote.abort_session(&cursor).await.unwrap();
        assert_eq!(remote.open_sessions(), 0);
        assert!(!remote.exists("c.bin").await.unwrap());
        assert!(matches!(
            remote.put_chunk(&cursor, 5, Bytes::from_static(b"67890"), 10).await,
            Err(RemoteError::SessionNotFound(_))
        ));
    }
}
