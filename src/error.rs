use thiserror::Error;

use crate::chat::ChatError;
use crate::daemon::DaemonError;
use crate::remote::RemoteError;

/// Failure classes of the transfer pipeline.
///
/// Transient daemon and remote errors are retried where they happen and only
/// reach this type once retries are exhausted. Every terminal variant is
/// rendered once to the job's invoker and the job is then dropped from the
/// registry.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("download daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("download daemon did not answer in time: {0}")]
    TransientDaemon(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Short machine-readable code, used by the HTTP layer and logs
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidInput(_) => "INVALID_INPUT",
            TransferError::DaemonUnavailable(_) => "DAEMON_UNAVAILABLE",
            TransferError::TransientDaemon(_) => "DAEMON_TIMEOUT",
            TransferError::DownloadFailed(_) => "DOWNLOAD_FAILED",
            TransferError::UploadFailed(_) => "UPLOAD_FAILED",
            TransferError::Cancelled => "CANCELLED",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<DaemonError> for TransferError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Closed | DaemonError::Transport(_) | DaemonError::Spawn(_) => {
                TransferError::DaemonUnavailable(err.to_string())
            }
            DaemonError::NotFound(_) | DaemonError::Timeout => {
                TransferError::TransientDaemon(err.to_string())
            }
            DaemonError::Rpc { .. } | DaemonError::Decode(_) => {
                TransferError::DownloadFailed(err.to_string())
            }
        }
    }
}

impl From<RemoteError> for TransferError {
    fn from(err: RemoteError) -> Self {
        TransferError::UploadFailed(err.to_string())
    }
}

impl From<ChatError> for TransferError {
    fn from(err: ChatError) -> Self {
        TransferError::InvalidInput(format!("chat attachment unavailable: {}", err))
    }
}
