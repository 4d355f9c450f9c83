//! HTTP handlers for the object lifecycle: upload, modify, delete, list.
//!
//! Uploads arrive as `multipart/form-data` with a single `file` field. The
//! request body is capped before anything reaches the backend; storage
//! concerns are delegated to the [`StorageBackend`] in [`AppState`].
//!
//! [`StorageBackend`]: crate::services::storage_backend::StorageBackend

use crate::{
    errors::AppError,
    handlers::require_key,
    services::storage_backend::BackendError,
    state::AppState,
};
use axum::{
    Json,
    extract::{
        Path, State,
        multipart::{Multipart, MultipartError, MultipartRejection},
    },
    http::{HeaderMap, StatusCode, header},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, future, stream};
use tracing::{error, info};

/// Form field carrying the uploaded file.
const FILE_FIELD: &str = "file";
/// Optional form field naming the target key on `POST /upload`.
const KEY_FIELD: &str = "key";

/// The parts of a multipart upload the facade cares about.
#[derive(Debug)]
pub struct UploadPayload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub explicit_key: Option<String>,
    pub data: Bytes,
}

impl UploadPayload {
    /// Explicit key when non-empty, otherwise the declared filename.
    fn resolve_key(&self) -> Result<String, AppError> {
        self.explicit_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .or(self.filename.as_deref().filter(|f| !f.is_empty()))
            .map(str::to_owned)
            .ok_or_else(|| {
                AppError::bad_request("Upload needs a filename or an explicit `key` field")
            })
    }
}

/// `POST /upload`: create an object keyed by the `key` field or the filename.
pub async fn upload_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, String), AppError> {
    ensure_within_limit(&headers, state.max_upload_bytes)?;
    let payload = read_upload(multipart, state.max_upload_bytes).await?;
    let key = payload.resolve_key()?;
    store_object(&state, &key, payload).await
}

/// `PUT /modify/{*key}`: fully replace (or create) the object at `key`.
pub async fn modify_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, String), AppError> {
    require_key(&key)?;
    ensure_within_limit(&headers, state.max_upload_bytes)?;
    let payload = read_upload(multipart, state.max_upload_bytes).await?;
    store_object(&state, &key, payload).await
}

/// `DELETE /delete/{*key}`: deleting a missing key is still a success.
pub async fn delete_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<(StatusCode, String), AppError> {
    require_key(&key)?;

    state.backend.remove(&key).await.map_err(|err| match err {
        BackendError::InvalidObjectKey => AppError::bad_request("Invalid object key"),
        err => {
            error!(key = %key, error = %err, "Error removing object");
            AppError::internal("Failed to delete file")
        }
    })?;

    info!(key = %key, "object deleted");
    Ok((
        StatusCode::OK,
        format!("Successfully deleted '{}' from bucket '{}'.\n", key, state.bucket()),
    ))
}

/// `GET /list`: every key in the bucket as one JSON array.
pub async fn list_objects(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    let keys: Vec<String> = state.backend.list().try_collect().await.map_err(|err| {
        error!(error = %err, "Error listing object");
        AppError::internal("Failed to list files")
    })?;

    Ok(Json(keys))
}

async fn store_object(
    state: &AppState,
    key: &str,
    payload: UploadPayload,
) -> Result<(StatusCode, String), AppError> {
    let size = payload.data.len() as u64;
    let body = stream::once(future::ready(Ok(payload.data))).boxed();

    let object = state
        .backend
        .put(key, body, size, payload.content_type.as_deref())
        .await
        .map_err(|err| match err {
            BackendError::InvalidObjectKey => AppError::bad_request("Invalid object key"),
            err => {
                error!(key = %key, error = %err, "Error uploading file");
                AppError::internal("Failed to upload file")
            }
        })?;

    info!(key = %object.key, size = object.size_bytes, etag = %object.etag, "object stored");
    Ok((
        StatusCode::CREATED,
        format!("Successfully processed '{}' in bucket '{}'.\n", key, state.bucket()),
    ))
}

/// Reject declared bodies over the cap before reading a single byte.
fn ensure_within_limit(headers: &HeaderMap, limit: usize) -> Result<(), AppError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    match declared {
        Some(len) if len > limit as u64 => Err(AppError::payload_too_large(limit)),
        _ => Ok(()),
    }
}

/// Walk the form, keeping exactly one `file` field and the optional `key`.
/// Other fields are skipped.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    limit: usize,
) -> Result<UploadPayload, AppError> {
    let mut multipart = multipart.map_err(|rejection| {
        AppError::bad_request(format!("Could not parse multipart form: {}", rejection.body_text()))
    })?;

    let mut file: Option<(Option<String>, Option<String>, Bytes)> = None;
    let mut explicit_key = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, limit))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(FILE_FIELD) => {
                if file.is_some() {
                    return Err(AppError::bad_request("Only one `file` field is allowed"));
                }
                let filename = field.file_name().map(str::to_owned);
                let content_type = field.content_type().map(str::to_owned);
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| multipart_error(err, limit))?;
                file = Some((filename, content_type, data));
            }
            Some(KEY_FIELD) => {
                let key = field
                    .text()
                    .await
                    .map_err(|err| multipart_error(err, limit))?;
                explicit_key = Some(key);
            }
            _ => {}
        }
    }

    let (filename, content_type, data) = file.ok_or_else(|| {
        AppError::bad_request("Could not retrieve file from form-data")
    })?;

    Ok(UploadPayload {
        filename,
        content_type,
        explicit_key,
        data,
    })
}

fn multipart_error(err: MultipartError, limit: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large(limit)
    } else {
        AppError::bad_request("Could not parse multipart form")
    }
}
