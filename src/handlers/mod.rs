//! HTTP handlers, grouped by concern.

pub mod health_handlers;
pub mod link_handlers;
pub mod object_handlers;
pub mod watch_handlers;

use crate::errors::AppError;

const KEY_REQUIRED: &str = "Object name is required in the URL path (e.g., /modify/myfile.png)";

/// Keys come from the request path and must not be empty.
pub fn require_key(key: &str) -> Result<(), AppError> {
    if key.is_empty() {
        return Err(AppError::bad_request(KEY_REQUIRED));
    }
    Ok(())
}

/// Mounted on the bare `/modify/`, `/delete/` and `/get-download-link/` paths.
pub async fn missing_key() -> AppError {
    AppError::bad_request(KEY_REQUIRED)
}

pub async fn method_not_allowed() -> AppError {
    AppError::method_not_allowed()
}

pub async fn not_found() -> AppError {
    AppError::not_found("Not found")
}
