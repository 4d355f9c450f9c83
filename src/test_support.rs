//! Shared fixtures for handler and backend tests.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, header},
};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use http_body_util::BodyExt;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use url::Url;

use crate::{
    models::{event::EventType, object::Object},
    routes::routes::routes,
    services::{
        local_backend::{LocalBackend, run_migrations},
        storage_backend::{
            BackendError, BackendResult, ByteStream, KeyStream, NotificationStream, ObjectReader,
            StorageBackend,
        },
        url_signer::UrlSigner,
    },
    state::AppState,
};

pub const TEST_BUCKET: &str = "test-bucket";
pub const TEST_UPLOAD_LIMIT: usize = 64 * 1024;

const BOUNDARY: &str = "gateway-test-boundary";

fn test_signer() -> UrlSigner {
    UrlSigner::new("test-secret", Url::parse("http://localhost:8080").unwrap())
}

/// A bootstrapped [`LocalBackend`] over a temp dir and in-memory SQLite.
pub async fn test_backend() -> (LocalBackend, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    run_migrations(&db).await.unwrap();

    let backend = LocalBackend::new(Arc::new(db), dir.path(), TEST_BUCKET, test_signer());
    backend.ensure_bucket().await.unwrap();
    (backend, dir)
}

/// Router over a real [`LocalBackend`]; the backend is returned for
/// inspection alongside it.
pub async fn test_app() -> (Router, LocalBackend, TempDir) {
    let (backend, dir) = test_backend().await;
    let state = AppState::new(Arc::new(backend.clone()), test_signer(), TEST_UPLOAD_LIMIT);
    (routes(TEST_UPLOAD_LIMIT).with_state(state), backend, dir)
}

/// Router whose backend fails every call, including `subscribe`.
pub fn failing_app() -> Router {
    app_over(FailingBackend {
        stream_fails_later: false,
    })
}

/// Router whose backend accepts subscriptions that then error out.
pub fn broken_stream_app() -> Router {
    app_over(FailingBackend {
        stream_fails_later: true,
    })
}

fn app_over(backend: impl StorageBackend + 'static) -> Router {
    let state = AppState::new(Arc::new(backend), test_signer(), TEST_UPLOAD_LIMIT);
    routes(TEST_UPLOAD_LIMIT).with_state(state)
}

pub fn body_stream(text: &'static str) -> ByteStream {
    stream::once(future::ready(Ok(Bytes::from_static(text.as_bytes())))).boxed()
}

pub async fn body_string(body: Body) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".pdf") {
        "application/pdf"
    } else if filename.ends_with(".txt") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

fn file_part(filename: &str, data: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
        BOUNDARY,
        filename,
        content_type_for(filename)
    )
    .into_bytes();
    part.extend_from_slice(data);
    part.extend_from_slice(b"\r\n");
    part
}

fn form_request(method: &str, uri: &str, mut body: Vec<u8>) -> Request<Body> {
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Request::builder()
        .method(method)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

/// A `multipart/form-data` request carrying one `file` field.
pub fn multipart_request(method: &str, uri: &str, filename: &str, data: &[u8]) -> Request<Body> {
    form_request(method, uri, file_part(filename, data))
}

/// Like [`multipart_request`] with an extra `key` text field after the file.
pub fn multipart_request_with_key(
    uri: &str,
    key: &str,
    filename: &str,
    data: &[u8],
) -> Request<Body> {
    let mut body = file_part(filename, data);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\n{}\r\n",
            BOUNDARY, key
        )
        .as_bytes(),
    );
    form_request("POST", uri, body)
}

struct FailingBackend {
    stream_fails_later: bool,
}

fn unavailable() -> BackendError {
    BackendError::Io(io::Error::new(io::ErrorKind::Other, "backend unavailable"))
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn bucket(&self) -> &str {
        TEST_BUCKET
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        Err(unavailable())
    }

    async fn ensure_bucket(&self) -> BackendResult<bool> {
        Err(unavailable())
    }

    async fn put(
        &self,
        _key: &str,
        _body: ByteStream,
        _size: u64,
        _content_type: Option<&str>,
    ) -> BackendResult<Object> {
        Err(unavailable())
    }

    async fn get(&self, _key: &str) -> BackendResult<ObjectReader> {
        Err(unavailable())
    }

    async fn remove(&self, _key: &str) -> BackendResult<()> {
        Err(unavailable())
    }

    /// One good key, then a failure: callers must discard the partial list.
    fn list(&self) -> KeyStream {
        stream::iter([Ok("partial.txt".to_string()), Err(unavailable())]).boxed()
    }

    async fn presign_get(&self, _key: &str, _ttl: Duration) -> BackendResult<String> {
        Err(unavailable())
    }

    async fn subscribe(&self, _events: &[EventType]) -> BackendResult<NotificationStream> {
        if self.stream_fails_later {
            Ok(stream::iter([Err(BackendError::Subscription(
                "connection reset".into(),
            ))])
            .boxed())
        } else {
            Err(unavailable())
        }
    }
}
