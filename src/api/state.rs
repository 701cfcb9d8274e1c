use std::sync::Arc;

use crate::api::error::ApiError;
use crate::chat::MemoryChat;
use crate::config::Config;
use crate::mirror::Mirror;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub chat: Arc<MemoryChat>,
    /// `None` when the download daemon failed to start
    pub mirror: Option<Arc<Mirror>>,
    pub startup_error: Option<String>,
}

impl AppState {
    pub fn new(config: Config, chat: Arc<MemoryChat>, mirror: Arc<Mirror>) -> Self {
        Self {
            config: Arc::new(config),
            chat,
            mirror: Some(mirror),
            startup_error: None,
        }
    }

    /// Transfer routes answer 503 while the server stays up
    pub fn disabled(config: Config, chat: Arc<MemoryChat>, reason: String) -> Self {
        Self {
            config: Arc::new(config),
            chat,
            mirror: None,
            startup_error: Some(reason),
        }
    }

    pub fn mirror(&self) -> Result<&Arc<Mirror>, ApiError> {
        self.mirror.as_ref().ok_or_else(|| {
            ApiError::Unavailable(
                self.startup_error
                    .clone()
                    .unwrap_or_else(|| "download daemon not running".into()),
            )
        })
    }
}
