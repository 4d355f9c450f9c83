//! The storage backend port.
//!
//! Handlers never talk to disk or SQLite directly; they go through
//! [`StorageBackend`], held as `Arc<dyn StorageBackend>` in the shared state.
//! A backend is scoped to the single bucket the process serves.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::{
    event::{EventType, Notification},
    object::Object,
};

/// Object payload flowing into or out of a backend.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Lazily enumerated object keys, in ascending key order.
pub type KeyStream = BoxStream<'static, BackendResult<String>>;

/// A live notification subscription. Dropping it releases the subscription.
pub type NotificationStream = BoxStream<'static, BackendResult<Notification>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("declared size {declared} does not match {written} bytes received")]
    SizeMismatch { declared: u64, written: u64 },
    #[error("notification subscription failed: {0}")]
    Subscription(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// An opened object: its metadata plus a stream over its bytes.
pub struct ObjectReader {
    pub meta: Object,
    pub body: ByteStream,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the bucket this backend serves.
    fn bucket(&self) -> &str;

    async fn bucket_exists(&self) -> BackendResult<bool>;

    /// Create the bucket unless it already exists. Returns `true` when it was
    /// created by this call.
    async fn ensure_bucket(&self) -> BackendResult<bool>;

    /// Create or fully replace `key`. Readers observe either the previous
    /// object or the new one, never a partial write.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: Option<&str>,
    ) -> BackendResult<Object>;

    async fn get(&self, key: &str) -> BackendResult<ObjectReader>;

    /// Remove `key`. Removing a key that does not exist succeeds.
    async fn remove(&self, key: &str) -> BackendResult<()>;

    fn list(&self) -> KeyStream;

    /// Signed, time-limited read URL for an existing object.
    async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String>;

    /// Open a notification subscription limited to the given event classes.
    async fn subscribe(&self, events: &[EventType]) -> BackendResult<NotificationStream>;
}
