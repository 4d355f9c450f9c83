//! Represents an object (file) stored in the bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single stored object.
///
/// The payload bytes live on disk; this row records what clients declared at
/// upload time plus the digest computed while the bytes were written.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket, may contain `/`).
    pub key: String,

    /// Content type (MIME type) declared by the uploader.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Timestamp of the last upload or overwrite.
    pub last_modified: DateTime<Utc>,
}

impl Object {
    /// Last path segment of the key, used for `Content-Disposition`.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
