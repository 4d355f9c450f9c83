//! Presigned read access.
//!
//! - `GET /get-download-link/{*key}` issues a short-lived signed URL instead of
//!   proxying bytes.
//! - `GET /download/{*key}?expires=&signature=` is where those URLs land; it
//!   checks the signature and streams the object.

use crate::{
    errors::AppError, handlers::require_key, models::object::Object,
    services::storage_backend::BackendError, state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadLink {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub signature: String,
}

/// `GET /get-download-link/{*key}`
///
/// Every presign failure is reported as 404. A missing object is by far the
/// most common cause, but signing errors land here too and are only visible in
/// the log.
pub async fn get_download_link(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DownloadLink>, AppError> {
    require_key(&key)?;

    let url = state
        .backend
        .presign_get(&key, state.presign_ttl)
        .await
        .map_err(|err| {
            warn!(key = %key, error = %err, "Error presigning object");
            AppError::not_found("File not found")
        })?;

    debug!(key = %key, ttl_secs = state.presign_ttl.as_secs(), "download link issued");
    Ok(Json(DownloadLink { url }))
}

/// `GET /download/{*key}`: stream an object for a valid presigned URL.
pub async fn download_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    state
        .signer
        .verify(&key, query.expires, &query.signature)
        .map_err(|err| AppError::forbidden(err.to_string()))?;

    let reader = state.backend.get(&key).await.map_err(|err| match err {
        BackendError::ObjectNotFound { .. } | BackendError::InvalidObjectKey => {
            AppError::not_found("File not found")
        }
        err => {
            error!(key = %key, error = %err, "Error getting object");
            AppError::internal("Could not read file")
        }
    })?;

    let mut response = Response::new(Body::from_stream(reader.body));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &reader.meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.file_name().replace('"', "")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let quoted = format!("\"{}\"", meta.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = meta
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
