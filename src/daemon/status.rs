//! Typed `tellStatus` response
//!
//! The daemon encodes integers and booleans as JSON strings and omits keys that
//! were not requested, so every field has a default and numbers go through
//! [`de::number`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path prefix the daemon uses for a torrent's metadata-only pseudo file
const METADATA_PREFIX: &str = "[METADATA]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Waiting,
    Active,
    Paused,
    Complete,
    Error,
    Removed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Complete | DownloadStatus::Error | DownloadStatus::Removed
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DownloadStatus::Waiting => "Waiting",
            DownloadStatus::Active => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Complete => "Complete",
            DownloadStatus::Error => "Error",
            DownloadStatus::Removed => "Removed",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UriEntry {
    pub uri: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(default, deserialize_with = "de::number")]
    pub index: u64,
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default, deserialize_with = "de::number")]
    pub length: u64,
    #[serde(default, deserialize_with = "de::number")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "de::flag")]
    pub selected: bool,
    #[serde(default)]
    pub uris: Vec<UriEntry>,
}

impl FileEntry {
    pub fn is_metadata(&self) -> bool {
        self.path.to_string_lossy().starts_with(METADATA_PREFIX)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TorrentInfoName {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BitTorrentInfo {
    #[serde(default)]
    pub info: Option<TorrentInfoName>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Point-in-time view of one daemon job
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default)]
    pub gid: String,
    #[serde(default)]
    pub status: DownloadStatus,
    #[serde(default, deserialize_with = "de::number")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "de::number")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "de::number")]
    pub download_speed: u64,
    #[serde(default, deserialize_with = "de::number")]
    pub connections: u64,
    #[serde(default, deserialize_with = "de::number")]
    pub num_seeders: u64,
    #[serde(default, deserialize_with = "de::flag")]
    pub seeder: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub following: Option<String>,
    #[serde(default)]
    pub bittorrent: Option<BitTorrentInfo>,
    #[serde(default)]
    pub info_hash: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StatusSnapshot {
    /// Keys fetched by the periodic poll
    pub const PROGRESS_KEYS: &'static [&'static str] = &[
        "gid",
        "status",
        "totalLength",
        "completedLength",
        "downloadSpeed",
        "files",
        "dir",
        "bittorrent",
        "errorCode",
        "errorMessage",
    ];

    /// True while the job only resolves torrent metadata
    pub fn is_metadata(&self) -> bool {
        !self.followed_by.is_empty() || self.files.first().is_some_and(FileEntry::is_metadata)
    }

    /// Completion as reported by the daemon. `bt_event` relaxes this to a
    /// seeding torrent, which the daemon keeps `active` after the payload is done.
    pub fn is_complete(&self, bt_event: bool) -> bool {
        self.status == DownloadStatus::Complete
            || (bt_event && self.seeder && self.status == DownloadStatus::Active)
    }

    pub fn is_torrent(&self) -> bool {
        self.bittorrent.is_some() || self.info_hash.is_some()
    }

    fn torrent_name(&self) -> Option<&str> {
        self.bittorrent
            .as_ref()
            .and_then(|bt| bt.info.as_ref())
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// First path component of the first file below the download directory
    fn top_level_entry(&self) -> Option<PathBuf> {
        let file = self.files.first()?;
        let dir = self.dir.as_deref()?;
        let relative = file.path.strip_prefix(dir).ok()?;
        relative.components().next().map(|c| dir.join(c.as_os_str()))
    }

    /// Display name: torrent name, metadata marker, top-level entry, or the
    /// last URI segment
    pub fn name(&self) -> String {
        if let Some(name) = self.torrent_name() {
            return name.to_string();
        }
        if let Some(file) = self.files.first() {
            if file.is_metadata() {
                return file.path.to_string_lossy().into_owned();
            }
            if let Some(entry) = self.top_level_entry() {
                if let Some(name) = entry.file_name() {
                    return name.to_string_lossy().into_owned();
                }
            }
            if let Some(name) = file.path.file_name() {
                return name.to_string_lossy().into_owned();
            }
            if let Some(uri) = file.uris.first() {
                if let Some(segment) = uri.uri.rsplit('/').find(|s| !s.is_empty()) {
                    return segment.to_string();
                }
            }
        }
        self.gid.clone()
    }

    /// Local file or directory holding the payload, once resolvable
    pub fn payload_path(&self) -> Option<PathBuf> {
        if self.is_metadata() {
            return None;
        }
        if let (Some(dir), Some(name)) = (self.dir.as_deref(), self.torrent_name()) {
            return Some(dir.join(name));
        }
        if let Some(entry) = self.top_level_entry() {
            return Some(entry);
        }
        self.files
            .first()
            .map(|f| f.path.clone())
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn progress(&self) -> f64 {
        crate::humanize::fraction(self.completed_length, self.total_length)
    }

    pub fn eta(&self) -> Option<Duration> {
        crate::humanize::estimate_remaining(
            self.total_length.saturating_sub(self.completed_length),
            self.download_speed as f64,
        )
    }

    pub fn is_within(&self, root: &Path) -> bool {
        self.dir.as_deref().is_some_and(|dir| dir.starts_with(root))
    }
}

mod de {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) if s.is_empty() => Ok(0),
            NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match BoolOrString::deserialize(deserializer)? {
            BoolOrString::Bool(b) => Ok(b),
            BoolOrString::String(s) => Ok(s == "true"),
        }
    }
}
