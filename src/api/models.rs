//! Request and response bodies of the HTTP command layer
//!
//! `POST /transfers` accepts either a URI list or a base64 torrent:
//!
//! ```json
//! { "chat_id": 42, "uris": ["magnet:?xt=urn:btih:EXAMPLE"] }
//! { "chat_id": 42, "torrent": "ZDQ6aW5mb2Q0Om5hbWUxOmFlZQ==" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chat::ChatId;

#[derive(Debug, Deserialize, Clone)]
pub struct SubmitRequest {
    #[serde(default)]
    pub chat_id: ChatId,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub torrent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
