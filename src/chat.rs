//! Chat collaborator interface
//!
//! The pipeline only needs four operations from a chat client. [`MemoryChat`]
//! keeps messages in memory, which backs the HTTP layer and the tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Edit with identical content; callers swallow this
    #[error("message content unchanged")]
    Unchanged,

    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("chat transport error: {0}")]
    Transport(String),
}

/// A file attached to a chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub file_name: String,
}

impl Attachment {
    pub fn is_torrent(&self) -> bool {
        Path::new(&self.file_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"))
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageId, ChatError>;

    /// Must return [`ChatError::Unchanged`] when `text` equals the current content
    async fn edit_message(&self, chat: ChatId, id: MessageId, text: &str) -> Result<(), ChatError>;

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), ChatError>;

    /// Saves the attachment under `dest_dir` and returns the local path
    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest_dir: &Path,
    ) -> Result<PathBuf, ChatError>;
}

/// One recorded chat operation
#[derive(Debug, Clone)]
pub enum ChatOp {
    Sent { chat: ChatId, id: MessageId, text: String, at: Instant },
    Edited { chat: ChatId, id: MessageId, text: String, at: Instant },
    Deleted { chat: ChatId, id: MessageId, at: Instant },
}

impl ChatOp {
    pub fn message_id(&self) -> MessageId {
        match self {
            ChatOp::Sent { id, .. } | ChatOp::Edited { id, .. } | ChatOp::Deleted { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
}

#[derive(Default)]
struct MemoryChatState {
    messages: HashMap<ChatId, BTreeMap<MessageId, String>>,
    attachments: HashMap<(ChatId, MessageId), (String, Bytes)>,
    ops: Vec<ChatOp>,
}

/// In-process chat: messages per chat plus an operation log
#[derive(Default)]
pub struct MemoryChat {
    state: Mutex<MemoryChatState>,
    next_id: AtomicI64,
}

impl MemoryChat {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an attachment and returns its handle
    pub fn add_attachment(&self, chat: ChatId, file_name: &str, content: Bytes) -> Attachment {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state()
            .attachments
            .insert((chat, message_id), (file_name.to_string(), content));
        Attachment {
            chat_id: chat,
            message_id,
            file_name: file_name.to_string(),
        }
    }

    pub fn messages(&self, chat: ChatId) -> Vec<ChatMessage> {
        self.state()
            .messages
            .get(&chat)
            .map(|msgs| {
                msgs.iter()
                    .map(|(id, text)| ChatMessage { id: *id, text: text.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn message(&self, chat: ChatId, id: MessageId) -> Option<String> {
        self.state().messages.get(&chat)?.get(&id).cloned()
    }

    pub fn ops(&self) -> Vec<ChatOp> {
        self.state().ops.clone()
    }
}

#[async_trait]
impl ChatClient for MemoryChat {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageId, ChatError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state();
        state.messages.entry(chat).or_default().insert(id, text.to_string());
        state.ops.push(ChatOp::Sent {
            chat,
            id,
            text: text.to_string(),
            at: Instant::now(),
        });
        debug!(chat, id, "Chat message sent");
        Ok(id)
    }

    async fn edit_message(&self, chat: ChatId, id: MessageId, text: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        let current = state
            .messages
            .get_mut(&chat)
            .and_then(|msgs| msgs.get_mut(&id))
            .ok_or(ChatError::NotFound(id))?;
        if current.as_str() == text {
            return Err(ChatError::Unchanged);
        }
        *current = text.to_string();
        state.ops.push(ChatOp::Edited {
            chat,
            id,
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, id: MessageId) -> Result<(), ChatError> {
        let mut state = self.state();
        state
            .messages
            .get_mut(&chat)
            .and_then(|msgs| msgs.remove(&id))
            .ok_or(ChatError::NotFound(id))?;
        state.ops.push(ChatOp::Deleted { chat, id, at: Instant::now() });
        Ok(())
    }

    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest_dir: &Path,
    ) -> Result<PathBuf, ChatError> {
        let (name, content) = self
            .state()
            .attachments
            .get(&(attachment.chat_id, attachment.message_id))
            .cloned()
            .ok_or(ChatError::NotFound(attachment.message_id))?;

        let path = dest_dir.join(&name);
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        Ok(path)
    }
}
