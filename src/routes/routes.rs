//! Defines routes for the gateway's object, link and event endpoints.
//!
//! ## Structure
//! - **Object lifecycle**
//!   - `POST   /upload`              create from multipart `file` (key = filename)
//!   - `PUT    /modify/{*key}`       replace from multipart `file`
//!   - `DELETE /delete/{*key}`       remove (missing keys still succeed)
//!   - `GET    /list`                JSON array of every key
//!
//! - **Presigned access**
//!   - `GET    /get-download-link/{*key}` `{"url": ...}` valid for 5 minutes
//!   - `GET    /download/{*key}`          target of those URLs
//!
//! - **Events**
//!   - `GET    /watch` SSE stream of created/removed notifications
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        link_handlers::{download_object, get_download_link},
        method_not_allowed, missing_key, not_found,
        object_handlers::{delete_object, list_objects, modify_object, upload_object},
        watch_handlers::watch_bucket,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router. Request bodies are capped at `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object lifecycle
        .route("/upload", post(upload_object))
        .route("/modify/", put(missing_key))
        .route("/modify/{*key}", put(modify_object))
        .route("/delete/", delete(missing_key))
        .route("/delete/{*key}", delete(delete_object))
        .route("/list", get(list_objects))
        // Presigned access
        .route("/get-download-link/", get(missing_key))
        .route("/get-download-link/{*key}", get(get_download_link))
        .route("/download/{*key}", get(download_object))
        // Events
        .route("/watch", get(watch_bucket))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
}
