//! Request checks shared by the handlers

use axum::http::{HeaderMap, header};
use serde::de::DeserializeOwned;

use crate::api::error::ApiError;

/// Torrent metainfo travels base64-encoded inside the JSON body
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Accepts `application/json` with optional parameters, nothing else
pub fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;

    let media_type: mime::Mime = content_type
        .parse()
        .map_err(|_| ApiError::InvalidPayload(format!("invalid Content-Type: {}", content_type)))?;
    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}",
            media_type.essence_str()
        )));
    }
    Ok(())
}

/// Content type, size limit, then deserialization
pub fn parse_json<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> Result<T, ApiError> {
    require_json(headers)?;
    if body.len() > MAX_BODY_SIZE {
        return Err(ApiError::PayloadTooLarge(body.len()));
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::SubmitRequest;
    use axum::http::HeaderValue;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    #[test]
    fn test_content_type_accepts_json_with_charset() {
        assert!(require_json(&headers("application/json")).is_ok());
        assert!(require_json(&headers("application/json; charset=utf-8")).is_ok());
    }

    #[test]
    fn test_content_type_rejects_others() {
        assert!(require_json(&headers("application/jsonp")).is_err());
        assert!(require_json(&headers("text/plain")).is_err());
        assert!(require_json(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_parse_submit_request() {
        let request: SubmitRequest =
            parse_json(&headers("application/json"), br#"{"chat_id": 5, "uris": ["https://a/b.iso"]}"#)
                .unwrap();
        assert_eq!(request.chat_id, 5);
        assert_eq!(request.uris, vec!["https://a/b.iso"]);
        assert!(request.torrent.is_none());

        let err = parse_json::<SubmitRequest>(&headers("application/json"), b"{not json").unwrap_err();
        assert!(matches!(err, ApiError::InvalidPayload(_)));
    }

    #[test]
    fn test_body_too_large() {
        let body = vec![b' '; MAX_BODY_SIZE + 1];
        let err = parse_json::<SubmitRequest>(&headers("application/json"), &body).unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));
    }
}
