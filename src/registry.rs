//! Transfer Registry
//!
//! Jobs, the cancel set and per-chat status bindings live behind one mutex.
//! The lock is held only for in-memory mutation and never across an await.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatId, MessageId};
use crate::daemon::{DownloadStatus, StatusSnapshot, Submission};
use crate::upload::ProgressSnapshot;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Uri,
    TorrentBlob,
    ChatAttachment,
}

/// Where a job is in the pipeline; completion handling runs at most once
/// because it requires `Downloading`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Downloading,
    Resolving,
    Uploading,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub name: String,
    pub snapshot: ProgressSnapshot,
}

/// Upload bookkeeping of one job; a single file counts as one leaf
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadState {
    pub files_done: usize,
    pub files_total: usize,
    /// In-flight files keyed by path relative to the payload root
    pub active: BTreeMap<String, UploadProgress>,
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub chat: ChatId,
    pub name: String,
    pub status: DownloadStatus,
    pub is_metadata: bool,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub local_path: Option<PathBuf>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub phase: JobPhase,
    pub upload: Option<UploadState>,
    /// Original submission, kept for reseeding torrents
    pub source: Option<Submission>,
    pub cancel: CancellationToken,
    pub submitted_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(job_id: impl Into<JobId>, kind: JobKind, chat: ChatId, name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            chat,
            name: name.into(),
            status: DownloadStatus::Waiting,
            is_metadata: false,
            total_length: 0,
            completed_length: 0,
            download_speed: 0,
            local_path: None,
            error_code: None,
            error_message: None,
            phase: JobPhase::Downloading,
            upload: None,
            source: None,
            cancel: CancellationToken::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: Submission) -> Self {
        self.is_metadata = matches!(&source, Submission::Uris(uris) if uris.iter().any(|u| u.starts_with("magnet:")));
        self.source = Some(source);
        self
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            kind: self.kind,
            chat: self.chat,
            name: self.name.clone(),
            status: self.status,
            phase: self.phase,
            is_metadata: self.is_metadata,
            total_length: self.total_length,
            completed_length: self.completed_length,
            download_speed: self.download_speed,
            error_message: self.error_message.clone(),
            upload: self.upload.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

/// Read-only copy of a job for rendering and the HTTP layer
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub chat: ChatId,
    pub name: String,
    pub status: DownloadStatus,
    pub phase: JobPhase,
    pub is_metadata: bool,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub error_message: Option<String>,
    pub upload: Option<UploadState>,
    pub submitted_at: DateTime<Utc>,
}

/// What the completion handler needs once it wins the phase guard
#[derive(Debug, Clone)]
pub struct Completion {
    pub chat: ChatId,
    pub kind: JobKind,
    pub source: Option<Submission>,
    pub cancel: CancellationToken,
}

/// The one status message a chat currently has
#[derive(Debug, Clone)]
pub struct StatusBinding {
    pub message_id: MessageId,
    pub last_text: String,
    pub last_edit: Instant,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, TransferJob>,
    cancel_set: HashSet<JobId>,
    bindings: HashMap<ChatId, StatusBinding>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: TransferJob) {
        self.lock().jobs.insert(job.job_id.clone(), job);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().jobs.contains_key(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<JobView> {
        self.lock().jobs.get(job_id).map(TransferJob::view)
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    pub fn cancel_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.lock().jobs.get(job_id).map(|job| job.cancel.clone())
    }

    /// Start event: waiting becomes active. False for unknown ids.
    pub fn confirm_started(&self, job_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                if job.status == DownloadStatus::Waiting {
                    job.status = DownloadStatus::Active;
                }
                true
            }
            None => false,
        }
    }

    /// Claims completion handling for a job still downloading
    pub fn begin_completion(&self, job_id: &str) -> Option<Completion> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(job_id)?;
        if job.phase != JobPhase::Downloading {
            return None;
        }
        job.phase = JobPhase::Resolving;
        Some(Completion {
            chat: job.chat,
            kind: job.kind,
            source: job.source.clone(),
            cancel: job.cancel.clone(),
        })
    }

    /// Returns a claimed job to `Downloading` (completion was premature)
    pub fn revert(&self, job_id: &str) {
        if let Some(job) = self.lock().jobs.get_mut(job_id) {
            if job.phase == JobPhase::Resolving {
                job.phase = JobPhase::Downloading;
            }
        }
    }

    /// Retires the metadata job and creates its payload successor in one step
    pub fn supersede(&self, old_id: &str, new_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(old) = inner.jobs.remove(old_id) else {
            return false;
        };
        let mut successor = TransferJob::new(new_id, old.kind, old.chat, old.name.clone());
        successor.source = old.source;
        successor.submitted_at = old.submitted_at;
        inner.jobs.insert(new_id.to_string(), successor);
        // A cancel aimed at the metadata job follows it to the payload
        if inner.cancel_set.remove(old_id) {
            inner.cancel_set.insert(new_id.to_string());
        }
        true
    }

    /// Moves a job into the upload phase. False if it was cancelled meanwhile.
    pub fn begin_upload(&self, job_id: &str, local_path: PathBuf, files_total: usize) -> bool {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        job.phase = JobPhase::Uploading;
        job.status = DownloadStatus::Complete;
        job.local_path = Some(local_path);
        job.upload = Some(UploadState {
            files_total,
            ..UploadState::default()
        });
        true
    }

    /// False if the job is gone, which tells the uploader to stop
    pub fn update_upload(&self, job_id: &str, key: &str, name: &str, snapshot: ProgressSnapshot) -> bool {
        let mut inner = self.lock();
        let Some(upload) = inner.jobs.get_mut(job_id).and_then(|job| job.upload.as_mut()) else {
            return false;
        };
        upload.active.insert(
            key.to_string(),
            UploadProgress {
                name: name.to_string(),
                snapshot,
            },
        );
        true
    }

    /// Records one finished leaf; returns `(done, total)`
    pub fn finish_upload_task(&self, job_id: &str, key: &str) -> Option<(usize, usize)> {
        let mut inner = self.lock();
        let upload = inner.jobs.get_mut(job_id)?.upload.as_mut()?;
        upload.active.remove(key);
        upload.files_done += 1;
        Some((upload.files_done, upload.files_total))
    }

    /// Drops an in-flight entry without counting it as done
    pub fn clear_upload_task(&self, job_id: &str, key: &str) {
        if let Some(upload) = self.lock().jobs.get_mut(job_id).and_then(|job| job.upload.as_mut()) {
            upload.active.remove(key);
        }
    }

    /// Refreshes counters from a daemon read
    pub fn apply_snapshot(&self, job_id: &str, snapshot: &StatusSnapshot) -> bool {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        // `complete` is recorded by `begin_upload`, together with the upload tasks
        if job.phase == JobPhase::Downloading && snapshot.status != DownloadStatus::Complete {
            job.status = snapshot.status;
        }
        job.total_length = snapshot.total_length;
        job.completed_length = snapshot.completed_length;
        job.download_speed = snapshot.download_speed;
        // a metadata job stays one; its payload arrives under a new id
        if snapshot.is_metadata() {
            job.is_metadata = true;
        }
        if !snapshot.files.is_empty() || snapshot.bittorrent.is_some() {
            job.name = snapshot.name();
        }
        if let Some(path) = snapshot.payload_path() {
            job.local_path = Some(path);
        }
        if snapshot.error_code.is_some() || snapshot.error_message.is_some() {
            job.error_code = snapshot.error_code.clone();
            job.error_message = snapshot.error_message.clone();
        }
        true
    }

    /// Removes a job and returns it (finish, failure, stop)
    pub fn take(&self, job_id: &str) -> Option<TransferJob> {
        let mut inner = self.lock();
        inner.cancel_set.remove(job_id);
        inner.jobs.remove(job_id)
    }

    /// Removes a job only while it is still downloading. Stop and error
    /// events for a job already handed to the uploader leave it alone.
    pub fn take_downloading(&self, job_id: &str) -> Option<TransferJob> {
        let mut inner = self.lock();
        if inner.jobs.get(job_id)?.phase != JobPhase::Downloading {
            return None;
        }
        inner.cancel_set.remove(job_id);
        inner.jobs.remove(job_id)
    }

    /// Requests abort; idempotent and valid for ids not (yet) registered
    pub fn cancel(&self, job_id: &str) {
        self.lock().cancel_set.insert(job_id.to_string());
    }

    pub fn pending_cancellations(&self) -> usize {
        self.lock().cancel_set.len()
    }

    /// Removes every cancelled job, fires its token, clears the cancel set.
    /// Ids without a job are dropped silently.
    pub fn reconcile_cancellations(&self) -> Vec<TransferJob> {
        let mut inner = self.lock();
        let ids: Vec<JobId> = inner.cancel_set.drain().collect();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(job) = inner.jobs.remove(&id) {
                job.cancel.cancel();
                removed.push(job);
            }
        }
        removed
    }

    /// Jobs the poll loop should refresh from the daemon
    pub fn downloading_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<(DateTime<Utc>, JobId)> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.phase == JobPhase::Downloading && job.kind != JobKind::ChatAttachment)
            .map(|job| (job.submitted_at, job.job_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// All jobs in submission order
    pub fn views(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self.lock().jobs.values().map(TransferJob::view).collect();
        views.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.job_id.cmp(&b.job_id)));
        views
    }

    pub fn has_jobs(&self, chat: ChatId) -> bool {
        self.lock().jobs.values().any(|job| job.chat == chat)
    }

    pub fn views_by_chat(&self) -> BTreeMap<ChatId, Vec<JobView>> {
        let mut grouped: BTreeMap<ChatId, Vec<JobView>> = BTreeMap::new();
        for view in self.views() {
            grouped.entry(view.chat).or_default().push(view);
        }
        grouped
    }

    pub fn binding(&self, chat: ChatId) -> Option<StatusBinding> {
        self.lock().bindings.get(&chat).cloned()
    }

    pub fn set_binding(&self, chat: ChatId, binding: StatusBinding) {
        self.lock().bindings.insert(chat, binding);
    }

    /// Records a successful edit; false if the binding was released or
    /// replaced in the meantime
    pub fn touch_binding(&self, chat: ChatId, message_id: MessageId, text: &str) -> bool {
        match self.lock().bindings.get_mut(&chat) {
            Some(binding) if binding.message_id == message_id => {
                binding.last_text = text.to_string();
                binding.last_edit = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Forgets a binding whose message no longer exists
    pub fn clear_binding(&self, chat: ChatId, message_id: MessageId) {
        let mut inner = self.lock();
        if inner.bindings.get(&chat).is_some_and(|b| b.message_id == message_id) {
            inner.bindings.remove(&chat);
        }
    }

    /// Removes and returns the bindings of chats that no longer have jobs
    pub fn release_idle_bindings(&self) -> Vec<(ChatId, StatusBinding)> {
        let mut inner = self.lock();
        let busy: HashSet<ChatId> = inner.jobs.values().map(|job| job.chat).collect();
        let idle: Vec<ChatId> = inner
            .bindings
            .keys()
            .filter(|chat| !busy.contains(chat))
            .copied()
            .collect();
        idle.into_iter()
            .filter_map(|chat| inner.bindings.remove(&chat).map(|b| (chat, b)))
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Shutdown: removes every job and fires all cancel tokens
    pub fn cancel_all(&self) -> Vec<TransferJob> {
        let mut inner = self.lock();
        inner.cancel_set.clear();
        let jobs: Vec<TransferJob> = inner.jobs.drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.cancel.cancel();
        }
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(id: &str, chat: ChatId) -> TransferJob {
        TransferJob::new(id, JobKind::Uri, chat, id)
    }

    fn snapshot() -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_uploaded: 5,
            total_bytes: 10,
            speed: 1.0,
            eta: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_confirm_started_ignores_unknown() {
        let registry = Registry::new();
        registry.insert(job("a", 1));

        assert!(registry.confirm_started("a"));
        assert_eq!(registry.get("a").unwrap().status, DownloadStatus::Active);
        assert!(!registry.confirm_started("ghost"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_completion_guard_runs_once() {
        let registry = Registry::new();
        registry.insert(job("a", 1));

        assert!(registry.begin_completion("a").is_some());
        assert!(registry.begin_completion("a").is_none());
        registry.revert("a");
        assert!(registry.begin_completion("a").is_some());
        assert!(registry.begin_completion("missing").is_none());
    }

    #[test]
    fn test_supersede_is_atomic_rename() {
        let registry = Registry::new();
        let metadata = TransferJob::new("meta", JobKind::Uri, 9, "[METADATA]x")
            .with_source(Submission::Uris(vec!["magnet:?xt=urn:btih:EXAMPLE".into()]));
        assert!(metadata.is_metadata);
        registry.insert(metadata);
        registry.cancel("meta");

        assert!(registry.supersede("meta", "payload"));

        assert!(!registry.contains("meta"));
        let successor = registry.get("payload").unwrap();
        assert!(!successor.is_metadata);
        assert_eq!(successor.chat, 9);
        assert_eq!(successor.phase, JobPhase::Downloading);
        assert_eq!(registry.len(), 1);

        let removed = registry.reconcile_cancellations();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].job_id, "payload");
        assert!(!registry.supersede("meta", "other"));
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        registry.cancel("ghost");
        registry.cancel("ghost");
        assert_eq!(registry.pending_cancellations(), 1);

        let removed = registry.reconcile_cancellations();
        assert!(removed.is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pending_cancellations(), 0);
    }

    #[test]
    fn test_reconcile_fires_token() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        let token = registry.cancel_token("a").unwrap();
        registry.cancel("a");

        let removed = registry.reconcile_cancellations();
        assert_eq!(removed.len(), 1);
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upload_progress_flow() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        assert!(registry.begin_upload("a", PathBuf::from("/d/Album"), 2));

        assert!(registry.update_upload("a", "01.flac", "01.flac", snapshot()));
        assert_eq!(registry.finish_upload_task("a", "01.flac"), Some((1, 2)));
        assert_eq!(registry.finish_upload_task("a", "02.flac"), Some((2, 2)));

        let view = registry.get("a").unwrap();
        assert_eq!(view.phase, JobPhase::Uploading);
        assert!(view.upload.unwrap().active.is_empty());

        registry.take("a");
        assert!(!registry.update_upload("a", "03.flac", "03.flac", snapshot()));
        assert!(!registry.begin_upload("a", PathBuf::from("/d"), 1));
    }

    #[test]
    fn test_bindings_released_when_chat_idle() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        registry.insert(job("b", 2));
        for chat in [1, 2] {
            registry.set_binding(
                chat,
                StatusBinding {
                    message_id: chat * 10,
                    last_text: String::new(),
                    last_edit: Instant::now(),
                },
            );
        }

        assert!(registry.release_idle_bindings().is_empty());
        registry.take("a");
        let released = registry.release_idle_bindings();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, 1);
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_metadata_flag_survives_sparse_snapshot() {
        let registry = Registry::new();
        registry.insert(
            TransferJob::new("meta", JobKind::Uri, 1, "x")
                .with_source(Submission::Uris(vec!["magnet:?xt=urn:btih:EXAMPLE".into()])),
        );
        let waiting = StatusSnapshot {
            gid: "meta".into(),
            status: DownloadStatus::Waiting,
            ..StatusSnapshot::default()
        };

        assert!(registry.apply_snapshot("meta", &waiting));
        assert!(registry.get("meta").unwrap().is_metadata);
    }

    #[test]
    fn test_has_jobs_per_chat() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        assert!(registry.has_jobs(1));
        assert!(!registry.has_jobs(2));
        registry.take("a");
        assert!(!registry.has_jobs(1));
    }

    #[test]
    fn test_downloading_ids_excludes_uploading() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        registry.insert(job("b", 1));
        registry.begin_upload("b", PathBuf::from("/d/b"), 1);
        assert_eq!(registry.downloading_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_take_downloading_skips_uploading_jobs() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        registry.insert(job("b", 1));
        registry.begin_upload("b", PathBuf::from("/d/b"), 1);

        assert!(registry.take_downloading("a").is_some());
        assert!(registry.take_downloading("b").is_none());
        assert!(registry.contains("b"));
        assert!(registry.take_downloading("ghost").is_none());
    }

    #[test]
    fn test_touch_binding_requires_same_message() {
        let registry = Registry::new();
        assert!(!registry.touch_binding(1, 10, "x"));
        registry.set_binding(
            1,
            StatusBinding {
                message_id: 10,
                last_text: String::new(),
                last_edit: Instant::now(),
            },
        );
        assert!(!registry.touch_binding(1, 11, "x"));
        assert!(registry.touch_binding(1, 10, "x"));
        assert_eq!(registry.binding(1).unwrap().last_text, "x");
    }

    #[test]
    fn test_cancel_all() {
        let registry = Registry::new();
        registry.insert(job("a", 1));
        registry.insert(job("b", 2));
        let tokens = [registry.cancel_token("a").unwrap(), registry.cancel_token("b").unwrap()];

        assert_eq!(registry.cancel_all().len(), 2);
        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
