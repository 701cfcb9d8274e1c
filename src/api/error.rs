use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use super::models::ErrorResponse;
use crate::error::TransferError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("transfer service unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Transfer(TransferError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Transfer(e) => match e {
                TransferError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                TransferError::DaemonUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                TransferError::TransientDaemon(_) => StatusCode::GATEWAY_TIMEOUT,
                TransferError::DownloadFailed(_) | TransferError::UploadFailed(_) => StatusCode::BAD_GATEWAY,
                TransferError::Cancelled => StatusCode::CONFLICT,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Unavailable(_) => "UNAVAILABLE",
            ApiError::Transfer(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<TransferError> for ApiError {
    fn from(value: TransferError) -> Self {
        ApiError::Transfer(value)
    }
}
