#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use mirrorbox::chat::{Attachment, ChatClient, ChatError, ChatId, MemoryChat, MessageId};
use mirrorbox::config::Config;
use mirrorbox::daemon::{
    AddOptions, BitTorrentInfo, DaemonError, DaemonEvent, DaemonRpc, DownloadStatus, FileEntry,
    Gateway, StatusSnapshot,
};
use mirrorbox::humanize::ByteSize;
use mirrorbox::mirror::Mirror;
use mirrorbox::orchestrator::TransferOutcome;
use mirrorbox::remote::{ChunkAck, FileMeta, ObjectRemote, RemoteError, RemoteFile, RemoteStore};
use mirrorbox::retry::RetryPolicy;

type Hook = Box<dyn FnOnce() + Send>;

/// Scripted download daemon: submissions become `waiting` jobs whose status
/// the test rewrites, and notifications are pushed by hand
pub struct MockDaemon {
    jobs: Mutex<HashMap<String, StatusSnapshot>>,
    calls: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<DaemonEvent>,
    full_status_hook: Mutex<Option<(String, Hook)>>,
}

impl MockDaemon {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let daemon = Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
            full_status_hook: Mutex::new(None),
        });
        (daemon, rx)
    }

    pub fn emit(&self, event: DaemonEvent) {
        self.events.send(event).unwrap();
    }

    pub fn set(&self, snapshot: StatusSnapshot) {
        self.jobs.lock().unwrap().insert(snapshot.gid.clone(), snapshot);
    }

    pub fn update(&self, gid: &str, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut jobs = self.jobs.lock().unwrap();
        f(jobs.get_mut(gid).unwrap());
    }

    /// Runs `hook` once, right before the first full status read of `gid`
    pub fn on_full_status(&self, gid: &str, hook: impl FnOnce() + Send + 'static) {
        *self.full_status_hook.lock().unwrap() = Some((gid.to_string(), Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_call(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn accept(&self, options: &AddOptions) -> String {
        let gid = options.gid.clone().unwrap();
        self.set(StatusSnapshot {
            gid: gid.clone(),
            status: DownloadStatus::Waiting,
            ..StatusSnapshot::default()
        });
        gid
    }
}

#[async_trait]
impl DaemonRpc for MockDaemon {
    async fn add_uri(&self, uris: &[String], options: &AddOptions) -> Result<String, DaemonError> {
        let gid = self.accept(options);
        self.record(format!("addUri {} seed_only={} {}", gid, options.seed_only, uris.join(" ")));
        Ok(gid)
    }

    async fn add_torrent(&self, _torrent: &str, options: &AddOptions) -> Result<String, DaemonError> {
        let gid = self.accept(options);
        self.record(format!("addTorrent {} seed_only={}", gid, options.seed_only));
        Ok(gid)
    }

    async fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<StatusSnapshot, DaemonError> {
        self.record(format!("tellStatus {}", gid));
        if keys.is_empty() {
            let hook = {
                let mut slot = self.full_status_hook.lock().unwrap();
                if slot.as_ref().is_some_and(|(target, _)| target == gid) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some((_, hook)) = hook {
                hook();
            }
        }
        self.jobs
            .lock()
            .unwrap()
            .get(gid)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(gid.to_string()))
    }

    async fn pause(&self, gid: &str) -> Result<(), DaemonError> {
        self.record(format!("pause {}", gid));
        self.update(gid, |s| s.status = DownloadStatus::Paused);
        Ok(())
    }

    async fn remove(&self, gid: &str, force: bool) -> Result<(), DaemonError> {
        self.record(format!("remove {} force={}", gid, force));
        if let Some(job) = self.jobs.lock().unwrap().get_mut(gid) {
            job.status = DownloadStatus::Removed;
        }
        Ok(())
    }

    async fn get_version(&self) -> Result<String, DaemonError> {
        Ok("1.37.0".into())
    }

    async fn shutdown(&self) -> Result<(), DaemonError> {
        self.record("shutdown".into());
        Ok(())
    }
}

/// Object store that rejects uploads of one file name
pub struct RejectingRemote {
    pub inner: Arc<ObjectRemote>,
    pub reject: String,
}

#[async_trait]
impl RemoteStore for RejectingRemote {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, RemoteError> {
        self.inner.create_folder(name, parent).await
    }

    fn folder_link(&self, folder_id: &str) -> String {
        self.inner.folder_link(folder_id)
    }

    async fn create_empty(&self, meta: &FileMeta) -> Result<RemoteFile, RemoteError> {
        self.inner.create_empty(meta).await
    }

    async fn open_session(&self, meta: &FileMeta) -> Result<String, RemoteError> {
        if meta.name == self.reject {
            return Err(RemoteError::Rejected("storage quota exceeded".into()));
        }
        self.inner.open_session(meta).await
    }

    async fn put_chunk(
        &self,
        cursor: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError> {
        self.inner.put_chunk(cursor, offset, data, total).await
    }

    async fn abort_session(&self, cursor: &str) -> Result<(), RemoteError> {
        self.inner.abort_session(cursor).await
    }
}

/// Object store that cancels every registered job once the first chunk is
/// stored, then lets the reporter reconcile
pub struct CancellingRemote {
    pub inner: Arc<ObjectRemote>,
    mirror: OnceLock<Arc<Mirror>>,
    chunks: AtomicUsize,
}

impl CancellingRemote {
    pub fn new(inner: Arc<ObjectRemote>) -> Self {
        Self {
            inner,
            mirror: OnceLock::new(),
            chunks: AtomicUsize::new(0),
        }
    }

    pub fn attach(&self, mirror: Arc<Mirror>) {
        let _ = self.mirror.set(mirror);
    }

    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for CancellingRemote {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, RemoteError> {
        self.inner.create_folder(name, parent).await
    }

    fn folder_link(&self, folder_id: &str) -> String {
        self.inner.folder_link(folder_id)
    }

    async fn create_empty(&self, meta: &FileMeta) -> Result<RemoteFile, RemoteError> {
        self.inner.create_empty(meta).await
    }

    async fn open_session(&self, meta: &FileMeta) -> Result<String, RemoteError> {
        self.inner.open_session(meta).await
    }

    async fn put_chunk(
        &self,
        cursor: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError> {
        let ack = self.inner.put_chunk(cursor, offset, data, total).await?;
        if self.chunks.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(mirror) = self.mirror.get() {
                for job in mirror.jobs() {
                    mirror.cancel(&job.job_id);
                }
                mirror.reporter().tick().await;
            }
        }
        Ok(ack)
    }

    async fn abort_session(&self, cursor: &str) -> Result<(), RemoteError> {
        self.inner.abort_session(cursor).await
    }
}

/// Chat client that runs a hook before its first message goes out
pub struct HookedChat {
    pub inner: Arc<MemoryChat>,
    before_send: Mutex<Option<Box<dyn FnOnce(ChatId) + Send>>>,
}

impl HookedChat {
    pub fn new(inner: Arc<MemoryChat>, hook: impl FnOnce(ChatId) + Send + 'static) -> Self {
        Self {
            inner,
            before_send: Mutex::new(Some(Box::new(hook))),
        }
    }
}

#[async_trait]
impl ChatClient for HookedChat {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageId, ChatError> {
        let hook = self.before_send.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(chat);
        }
        self.inner.send_message(chat, text).await
    }

    async fn edit_message(&self, chat: ChatId, id: MessageId, text: &str) -> Result<(), ChatError> {
        self.inner.edit_message(chat, id, text).await
    }

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), ChatError> {
        self.inner.delete_message(chat, id).await
    }

    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest_dir: &Path,
    ) -> Result<PathBuf, ChatError> {
        self.inner.download_attachment(attachment, dest_dir).await
    }
}

pub fn test_config(download_dir: &Path) -> Config {
    let mut config = Config::default();
    config.daemon.download_dir = download_dir.to_path_buf();
    config.storage.chunk_size = ByteSize(4);
    config.storage.max_retries = 2;
    config.storage.upload_workers = 2;
    config.storage.parent_id = Some("mirror".into());
    // the background loop ticks once at start, then stays out of the way
    config.reporter.tick_ms = 3_600_000;
    config.shutdown.reseed_grace_secs = 1;
    config
}

pub struct Harness {
    pub daemon: Arc<MockDaemon>,
    pub remote: Arc<ObjectRemote>,
    pub chat: Arc<MemoryChat>,
    pub mirror: Arc<Mirror>,
    pub outcomes: broadcast::Receiver<TransferOutcome>,
}

impl Harness {
    pub fn new(download_dir: &Path) -> Self {
        Self::with_config(test_config(download_dir), None)
    }

    pub fn with_config(config: Config, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        let chat = Arc::new(MemoryChat::new());
        Self::with_chat(config, remote, chat.clone(), chat)
    }

    /// `client` is what the pipeline talks to; `chat` is the store it ends up in
    pub fn with_chat(
        config: Config,
        remote: Option<Arc<dyn RemoteStore>>,
        client: Arc<dyn ChatClient>,
        chat: Arc<MemoryChat>,
    ) -> Self {
        let (daemon, events) = MockDaemon::new();
        let gateway = Arc::new(
            Gateway::new(daemon.clone()).with_status_retry(RetryPolicy::new(5, Duration::from_millis(1))),
        );
        let objects = Arc::new(ObjectRemote::in_memory());
        let remote = remote.unwrap_or_else(|| objects.clone() as Arc<dyn RemoteStore>);
        let mirror = Mirror::assemble(&config, gateway, events, remote, client);
        let outcomes = mirror.subscribe();
        Self {
            daemon,
            remote: objects,
            chat,
            mirror,
            outcomes,
        }
    }

    pub async fn next_outcome(&mut self) -> TransferOutcome {
        tokio::time::timeout(Duration::from_secs(10), self.outcomes.recv())
            .await
            .expect("no outcome within 10s")
            .expect("outcome channel closed")
    }
}

/// Polls `condition` every 10ms for up to 10s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 10s");
}

pub fn file_entry(path: PathBuf, length: u64) -> FileEntry {
    FileEntry {
        index: 1,
        path,
        length,
        completed_length: length,
        selected: true,
        uris: Vec::new(),
    }
}

/// Daemon status of a finished single-file HTTP download
pub fn completed_file(gid: &str, dir: &Path, name: &str, length: u64) -> StatusSnapshot {
    StatusSnapshot {
        gid: gid.to_string(),
        status: DownloadStatus::Complete,
        total_length: length,
        completed_length: length,
        dir: Some(dir.to_path_buf()),
        files: vec![file_entry(dir.join(name), length)],
        ..StatusSnapshot::default()
    }
}

/// Daemon status of a finished multi-file torrent rooted at `dir/name`
pub fn completed_torrent(gid: &str, dir: &Path, name: &str, files: &[(&str, u64)]) -> StatusSnapshot {
    let total = files.iter().map(|(_, len)| len).sum();
    StatusSnapshot {
        gid: gid.to_string(),
        status: DownloadStatus::Complete,
        total_length: total,
        completed_length: total,
        dir: Some(dir.to_path_buf()),
        files: files
            .iter()
            .map(|(path, len)| file_entry(dir.join(name).join(path), *len))
            .collect(),
        bittorrent: Some(BitTorrentInfo {
            info: Some(mirrorbox::daemon::TorrentInfoName { name: name.to_string() }),
            mode: Some("multi".into()),
            comment: None,
        }),
        info_hash: Some("aaaabbbbccccdddd".into()),
        ..StatusSnapshot::default()
    }
}
