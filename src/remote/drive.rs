//! Google Drive v3 backend using resumable uploads
//!
//! A session is opened with `uploadType=resumable`; the returned `Location`
//! is the cursor. Each chunk is a `PUT` with `Content-Range`. The server
//! answers `308` with a `Range` header while incomplete and `200`/`201` with
//! the file resource on the last chunk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ChunkAck, FileMeta, RemoteError, RemoteFile, RemoteStore};

const API_BASE: &str = "https://www.googleapis.com";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,size,webContentLink";
const TOKEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Supplies OAuth access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;
}

/// Fixed token from configuration
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, RemoteError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    web_content_link: Option<String>,
}

impl DriveFile {
    fn into_remote(self, fallback_name: &str, expected: u64) -> RemoteFile {
        let size = self
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(expected);
        let link = self
            .web_content_link
            .unwrap_or_else(|| format!("https://drive.google.com/uc?id={}&export=download", self.id));
        let name = if self.name.is_empty() {
            fallback_name.to_string()
        } else {
            self.name
        };
        RemoteFile {
            id: self.id,
            name,
            size,
            link,
        }
    }
}

pub struct DriveStore {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    base: String,
}

impl DriveStore {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self, RemoteError> {
        Self::with_base_url(tokens, API_BASE)
    }

    /// Points the client at another API host
    pub fn with_base_url(tokens: Arc<dyn TokenSource>, base: &str) -> Result<Self, RemoteError> {
        // 308 is the resumable protocol's "incomplete", not a redirect
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        Ok(Self {
            http,
            tokens,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn token(&self) -> Result<String, RemoteError> {
        tokio::time::timeout(TOKEN_TIMEOUT, self.tokens.access_token())
            .await
            .map_err(|_| RemoteError::Rejected("access token not obtained within 60s".into()))?
    }

    fn files_url(&self) -> String {
        format!(
            "{}/drive/v3/files?supportsAllDrives=true&fields={}",
            self.base, FILE_FIELDS
        )
    }

    async fn create_metadata(&self, body: serde_json::Value) -> Result<DriveFile, RemoteError> {
        let token = self.token().await?;
        let response = self
            .http
            .post(self.files_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<DriveFile>()
            .await
            .map_err(|e| RemoteError::Rejected(format!("malformed file resource: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

/// 429 and 5xx are worth retrying; other failures are terminal
fn classify(status: StatusCode, body: String) -> RemoteError {
    let message = format!("{}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RemoteError::Transient(message)
    } else {
        RemoteError::Rejected(message)
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, body))
}

/// `Range: bytes=0-N` acknowledges N + 1 bytes
fn parse_range(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split('-').nth(1))
        .and_then(|end| end.parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, RemoteError> {
        let mut body = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            body["parents"] = json!([parent]);
        }
        let folder = self.create_metadata(body).await?;
        debug!(folder = %folder.id, name, "Created Drive folder");
        Ok(folder.id)
    }

    fn folder_link(&self, folder_id: &str) -> String {
        format!("https://drive.google.com/drive/folders/{}", folder_id)
    }

    async fn create_empty(&self, meta: &FileMeta) -> Result<RemoteFile, RemoteError> {
        let mut body = json!({ "name": meta.name, "mimeType": meta.mime_type });
        if let Some(parent) = &meta.parent {
            body["parents"] = json!([parent]);
        }
        let file = self.create_metadata(body).await?;
        info!(file = %file.id, name = %meta.name, "Created empty Drive file");
        Ok(file.into_remote(&meta.name, 0))
    }

    async fn open_session(&self, meta: &FileMeta) -> Result<String, RemoteError> {
        let token = self.token().await?;
        let mut body = json!({ "name": meta.name, "mimeType": meta.mime_type });
        if let Some(parent) = &meta.parent {
            body["parents"] = json!([parent]);
        }

        let url = format!(
            "{}/upload/drive/v3/files?uploadType=resumable&supportsAllDrives=true&fields={}",
            self.base, FILE_FIELDS
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", meta.mime_type.as_str())
            .header("X-Upload-Content-Length", meta.size)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Rejected("resumable session without Location".into()))
    }

    async fn put_chunk(
        &self,
        cursor: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError> {
        let len = data.len() as u64;
        let range = if len == 0 {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", offset, offset + len - 1, total)
        };

        let response = self
            .http
            .put(cursor)
            .header(CONTENT_RANGE, range)
            .header(CONTENT_LENGTH, len)
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::PERMANENT_REDIRECT {
            let received = parse_range(response.headers().get(RANGE).and_then(|v| v.to_str().ok()));
            return Ok(ChunkAck::Partial { received });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::SessionNotFound(cursor.to_string()));
        }

        let response = check_status(response).await?;
        let file = response
            .json::<DriveFile>()
            .await
            .map_err(|e| RemoteError::Rejected(format!("malformed file resource: {}", e)))?;
        Ok(ChunkAck::Done(file.into_remote("", total)))
    }

    async fn abort_session(&self, cursor: &str) -> Result<(), RemoteError> {
        let response = self.http.delete(cursor).send().await.map_err(transport_error)?;
        // Drive answers 499 to a cancelled session
        match response.status().as_u16() {
            200..=299 | 404 | 499 => Ok(()),
            _ => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(classify(status, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, HeaderValue, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{post, put};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range(Some("bytes=0-262143")), 262_144);
        assert_eq!(parse_range(None), 0);
        assert_eq!(parse_range(Some("garbage")), 0);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!classify(StatusCode::FORBIDDEN, "storageQuotaExceeded".into()).is_transient());
    }

    #[test]
    fn test_folder_link() {
        let store = DriveStore::new(Arc::new(StaticToken::new("t"))).unwrap();
        assert_eq!(
            store.folder_link("1AbC"),
            "https://drive.google.com/drive/folders/1AbC"
        );
    }

    async fn open(State(base): State<String>) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            "location",
            HeaderValue::from_str(&format!("{}/session/42", base)).unwrap(),
        );
        (AxumStatus::OK, headers)
    }

    async fn chunk(Path(_id): Path<String>, headers: HeaderMap) -> impl IntoResponse {
        let range = headers["content-range"].to_str().unwrap().to_string();
        let (span, total) = range.trim_start_matches("bytes ").split_once('/').unwrap();
        let end: u64 = span.split('-').nth(1).unwrap().parse().unwrap();
        let total: u64 = total.parse().unwrap();

        if end + 1 < total {
            let mut out = HeaderMap::new();
            out.insert("range", HeaderValue::from_str(&format!("bytes=0-{}", end)).unwrap());
            (AxumStatus::PERMANENT_REDIRECT, out, String::new())
        } else {
            let body = json!({"id": "file-1", "name": "a.bin", "size": total.to_string()});
            (AxumStatus::OK, HeaderMap::new(), body.to_string())
        }
    }

    async fn spawn_mock_drive() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new()
            .route("/upload/drive/v3/files", post(open))
            .route("/session/{id}", put(chunk))
            .with_state(base.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn test_resumable_upload_against_mock() {
        let base = spawn_mock_drive().await;
        let store = DriveStore::with_base_url(Arc::new(StaticToken::new("t")), &base).unwrap();
        let meta = FileMeta {
            name: "a.bin".into(),
            mime_type: "application/octet-stream".into(),
            parent: Some("root".into()),
            size: 8,
        };

        let cursor = store.open_session(&meta).await.unwrap();
        assert!(cursor.ends_with("/session/42"));

        let ack = store
            .put_chunk(&cursor, 0, Bytes::from_static(b"abcd"), 8)
            .await
            .unwrap();
        assert_eq!(ack, ChunkAck::Partial { received: 4 });

        let ack = store
            .put_chunk(&cursor, 4, Bytes::from_static(b"efgh"), 8)
            .await
            .unwrap();
        let ChunkAck::Done(file) = ack else {
            panic!("expected final ack");
        };
        assert_eq!(file.id, "file-1");
        assert_eq!(file.size, 8);
        assert!(file.link.contains("file-1"));
    }
}
