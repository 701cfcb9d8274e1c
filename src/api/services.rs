use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::info;

use super::{
    models::{HealthResponse, SubmitRequest, SubmitResponse},
    state::AppState,
    utils::parse_json,
};
use crate::api::error::ApiError;
use crate::chat::ChatId;
use crate::daemon::Submission;
use crate::observability::Metrics;

/// Submits a URI set or a base64 torrent (POST /transfers)
///
/// Returns 202 with the job id; the download itself reports asynchronously.
pub async fn submit_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mirror = state.mirror()?;
    let request: SubmitRequest = parse_json(&headers, &body)?;

    let submission = match (request.torrent, request.uris.is_empty()) {
        (Some(_), false) => {
            return Err(ApiError::InvalidPayload(
                "submit either uris or a torrent, not both".into(),
            ));
        }
        (Some(blob), true) => Submission::torrent_base64(&blob)?,
        (None, _) => Submission::uris(request.uris)?,
    };

    let job_id = mirror.submit(request.chat_id, submission).await?;
    info!(job_id = %job_id, chat = request.chat_id, "Transfer accepted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// All tracked transfers (GET /transfers)
pub async fn list_transfers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.mirror()?.jobs()))
}

/// Cancels a transfer (DELETE /transfers/{job_id}); unknown ids are accepted
pub async fn cancel_transfer(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.mirror()?.cancel(&job_id);
    Ok(StatusCode::ACCEPTED)
}

pub async fn pause_transfer(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mirror = state.mirror()?;
    if mirror.job(&job_id).is_none() {
        return Err(ApiError::NotFound(job_id));
    }
    mirror.pause(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Messages the pipeline wrote to a chat (GET /chats/{chat_id}/messages)
pub async fn chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
) -> impl IntoResponse {
    Json(state.chat.messages(chat_id))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = match &state.mirror {
        Some(mirror) => mirror.metrics().snapshot(),
        None => Metrics::new().snapshot(),
    };
    Json(snapshot)
}

/// Reports 503 when the download daemon is not running
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());
    let daemon = match (&state.mirror, &state.startup_error) {
        (Some(_), _) => "healthy".to_string(),
        (None, Some(reason)) => format!("unavailable: {}", reason),
        (None, None) => "unavailable".to_string(),
    };
    components.insert("daemon".to_string(), daemon);
    components.insert(
        "storage".to_string(),
        format!("{:?}", state.config.storage.provider).to_lowercase(),
    );

    let healthy = state.mirror.is_some();
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    (status_code, Json(response))
}
