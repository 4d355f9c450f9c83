//! src/services/local_backend.rs
//!
//! LocalBackend: the [`StorageBackend`] used by the gateway binary. Object
//! payloads live on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`, metadata lives in SQLite, and
//! mutations are announced on an in-process broadcast channel that watch
//! sessions subscribe to.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, future, stream};
use md5::Context;
use sqlx::SqlitePool;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, broadcast},
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::{
        bucket::Bucket,
        event::{EventRecord, EventType, Notification},
        object::Object,
    },
    services::{
        storage_backend::{
            BackendError, BackendResult, ByteStream, KeyStream, NotificationStream, ObjectReader,
            StorageBackend,
        },
        url_signer::UrlSigner,
    },
};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const LIST_PAGE_SIZE: usize = 1000;
/// Notifications buffered per subscriber before it is reported as lagging.
const NOTIFICATION_CAPACITY: usize = 256;
/// Writers and deleters of the same key serialize on one of these stripes.
const KEY_LOCK_STRIPES: usize = 64;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> BackendResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[derive(Clone)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for metadata operations.
    db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    bucket: String,

    signer: UrlSigner,

    events: broadcast::Sender<Notification>,

    key_locks: Arc<[Mutex<()>]>,
}

impl LocalBackend {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        signer: UrlSigner,
    ) -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.into(),
            signer,
            events,
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of live notification subscriptions.
    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// A key must map to a file beneath the bucket directory.
    ///
    /// Every `/`-separated segment has to be non-empty and neither `.` nor
    /// `..`. Control characters and backslashes are rejected anywhere. Dots
    /// inside a segment (`report..final.txt`) are fine.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(BackendError::InvalidObjectKey);
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(BackendError::InvalidObjectKey);
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(BackendError::InvalidObjectKey);
        }
        Ok(())
    }

    fn key_lock(&self, key: &str) -> &Mutex<()> {
        let digest = md5::compute(key.as_bytes());
        &self.key_locks[usize::from(digest[0]) % self.key_locks.len()]
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key) as
    /// lowercase hex. Keeps the file count per directory low.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_bucket(&self) -> BackendResult<Bucket> {
        sqlx::query_as::<_, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(&self.bucket)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| BackendError::BucketNotFound(self.bucket.clone()))
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> BackendResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: key.to_string(),
        })
    }

    /// One page of keys strictly after `after`, in ascending order.
    async fn list_page(&self, after: &str, limit: usize) -> BackendResult<Vec<String>> {
        let bucket = self.fetch_bucket().await?;
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM objects
             WHERE bucket_id = ? AND key > ?
             ORDER BY key ASC
             LIMIT ?",
        )
        .bind(bucket.id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(keys)
    }

    /// Stream `body` into a temp file next to `final_path`, checking the byte
    /// count against `size`. Returns the temp path, byte count and MD5 etag.
    async fn write_temp(
        final_path: &Path,
        mut body: ByteStream,
        size: u64,
    ) -> BackendResult<(PathBuf, u64, String)> {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut attempts = 0;
        let mut file = loop {
            fs::create_dir_all(&parent).await?;
            match File::create(&tmp_path).await {
                Ok(file) => break file,
                // A concurrent delete may prune the directory before the temp
                // file lands in it.
                Err(err) if err.kind() == ErrorKind::NotFound && attempts < 3 => attempts += 1,
                Err(err) => return Err(err.into()),
            }
        };

        let mut written: u64 = 0;
        let mut digest = Context::new();
        let result = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                written += chunk.len() as u64;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            if written != size {
                return Err(BackendError::SizeMismatch {
                    declared: size,
                    written,
                });
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, BackendError>(())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok((tmp_path, written, format!("{:x}", digest.compute())))
    }

    /// Hard-link the current payload at `path` aside so it can be put back if
    /// the metadata commit fails. `None` when there is no current payload.
    async fn link_backup(path: &Path) -> BackendResult<Option<PathBuf>> {
        let backup = path.with_file_name(format!(".bak-{}", Uuid::new_v4()));
        match fs::hard_link(path, &backup).await {
            Ok(()) => Ok(Some(backup)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Put the payload at `path` back to what `link_backup` saw.
    async fn restore_previous(path: &Path, backup: Option<PathBuf>) {
        let result = match backup {
            Some(backup) => fs::rename(&backup, path).await,
            None => fs::remove_file(path).await,
        };
        if let Err(err) = result {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to restore {}: {}", path.display(), err);
            }
        }
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    fn publish(&self, record: EventRecord) {
        match self.events.send(Notification::single(record)) {
            Ok(watchers) => debug!(watchers, "published bucket notification"),
            // No receivers just means nobody is watching.
            Err(_) => debug!("no watchers for bucket notification"),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> BackendResult<bool> {
        match self.fetch_bucket().await {
            Ok(_) => Ok(fs::try_exists(self.bucket_root()).await?),
            Err(BackendError::BucketNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn ensure_bucket(&self) -> BackendResult<bool> {
        fs::create_dir_all(self.bucket_root()).await?;
        let result = sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(&self.bucket)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the payload to a temp file, then upsert metadata and rename the
    /// file into place inside one transaction. A failure at any step leaves
    /// the previous object untouched.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: Option<&str>,
    ) -> BackendResult<Object> {
        Self::ensure_key_safe(key)?;
        let bucket = self.fetch_bucket().await?;

        let file_path = self.object_path(key);
        let (tmp_path, written, etag) = Self::write_temp(&file_path, body, size).await?;

        let _guard = self.key_lock(key).lock().await;
        let stored = async {
            let mut tx = self.db.begin().await?;
            let object = sqlx::query_as::<_, Object>(
                r#"
                INSERT INTO objects (
                    id, bucket_id, key, content_type, size_bytes, etag, last_modified
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(bucket_id, key) DO UPDATE SET
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    etag = excluded.etag,
                    last_modified = excluded.last_modified
                RETURNING id, bucket_id, key, content_type, size_bytes, etag, last_modified
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(bucket.id)
            .bind(key)
            .bind(content_type)
            .bind(written as i64)
            .bind(&etag)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;

            let backup = Self::link_backup(&file_path).await?;
            let swapped = async {
                fs::rename(&tmp_path, &file_path).await?;
                tx.commit().await?;
                Ok::<_, BackendError>(())
            }
            .await;
            match swapped {
                Ok(()) => {
                    if let Some(backup) = backup {
                        let _ = fs::remove_file(backup).await;
                    }
                    Ok::<_, BackendError>(object)
                }
                Err(err) => {
                    Self::restore_previous(&file_path, backup).await;
                    Err(err)
                }
            }
        }
        .await;

        let object = match stored {
            Ok(object) => object,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        debug!("stored {} ({} bytes) at {}", key, written, file_path.display());
        self.publish(EventRecord::created(&self.bucket, &object));
        Ok(object)
    }

    async fn get(&self, key: &str) -> BackendResult<ObjectReader> {
        Self::ensure_key_safe(key)?;
        let bucket = self.fetch_bucket().await?;
        let _guard = self.key_lock(key).lock().await;
        let meta = self.fetch_object(&bucket, key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                }
            } else {
                BackendError::Io(err)
            }
        })?;

        Ok(ObjectReader {
            meta,
            body: ReaderStream::new(file).boxed(),
        })
    }

    async fn remove(&self, key: &str) -> BackendResult<()> {
        // A key that cannot be stored cannot exist either.
        if Self::ensure_key_safe(key).is_err() {
            debug!("delete of unstorable key {:?} is a no-op", key);
            return Ok(());
        }
        let bucket = self.fetch_bucket().await?;
        let _guard = self.key_lock(key).lock().await;

        let result = sqlx::query("DELETE FROM objects WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }

        if result.rows_affected() > 0 {
            self.publish(EventRecord::removed(&self.bucket, key));
        }
        Ok(())
    }

    /// Keyset-paginated enumeration: each page is fetched only when the
    /// previous one has been consumed.
    fn list(&self) -> KeyStream {
        let backend = self.clone();
        stream::try_unfold(Some(String::new()), move |cursor| {
            let backend = backend.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok::<_, BackendError>(None);
                };
                let page = backend.list_page(&after, LIST_PAGE_SIZE).await?;
                let next = if page.len() == LIST_PAGE_SIZE {
                    page.last().cloned()
                } else {
                    None
                };
                let keys = stream::iter(page.into_iter().map(Ok::<_, BackendError>));
                Ok(Some((keys, next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        Self::ensure_key_safe(key)?;
        let bucket = self.fetch_bucket().await?;
        self.fetch_object(&bucket, key).await?;
        Ok(self.signer.presign_get(key, ttl))
    }

    async fn subscribe(&self, events: &[EventType]) -> BackendResult<NotificationStream> {
        let events = events.to_vec();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let item = match item {
                Ok(notification) => notification.retain_types(&events).map(Ok),
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(
                    BackendError::Subscription(format!("missed {} notifications", missed)),
                )),
            };
            future::ready(item)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_stream, test_backend};

    async fn put_text(backend: &LocalBackend, key: &str, text: &'static str) -> Object {
        backend
            .put(key, body_stream(text), text.len() as u64, Some("text/plain"))
            .await
            .unwrap()
    }

    async fn read_all(backend: &LocalBackend, key: &str) -> Vec<u8> {
        let reader = backend.get(key).await.unwrap();
        let chunks: Vec<_> = reader.body.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let (backend, _dir) = test_backend().await;

        assert!(backend.bucket_exists().await.unwrap());
        assert!(!backend.ensure_bucket().await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let (backend, _dir) = test_backend().await;

        put_text(&backend, "notes/a.txt", "first").await;
        let second = put_text(&backend, "notes/a.txt", "second version").await;

        assert_eq!(read_all(&backend, "notes/a.txt").await, b"second version");
        assert_eq!(second.size_bytes, 14);
        assert_eq!(second.etag, format!("{:x}", md5::compute("second version")));
        let keys: Vec<String> = backend.list().try_collect().await.unwrap();
        assert_eq!(keys, vec!["notes/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn size_mismatch_keeps_previous_object() {
        let (backend, _dir) = test_backend().await;
        put_text(&backend, "a.txt", "original").await;

        let err = backend
            .put("a.txt", body_stream("short"), 99, None)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::SizeMismatch { declared: 99, written: 5 }));
        assert_eq!(read_all(&backend, "a.txt").await, b"original");
    }

    #[tokio::test]
    async fn remove_missing_key_succeeds() {
        let (backend, _dir) = test_backend().await;
        put_text(&backend, "keep.txt", "x").await;

        backend.remove("never-existed.txt").await.unwrap();
        backend.remove("keep.txt").await.unwrap();

        let keys: Vec<String> = backend.list().try_collect().await.unwrap();
        assert!(keys.is_empty());
        assert!(matches!(
            backend.get("keep.txt").await,
            Err(BackendError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_spans_pages_in_key_order() {
        let (backend, _dir) = test_backend().await;
        let bucket = backend.fetch_bucket().await.unwrap();
        let total = LIST_PAGE_SIZE + 3;
        for i in (0..total).rev() {
            sqlx::query(
                "INSERT INTO objects (id, bucket_id, key, content_type, size_bytes, etag, last_modified)
                 VALUES (?, ?, ?, NULL, 0, '', ?)",
            )
            .bind(Uuid::new_v4())
            .bind(bucket.id)
            .bind(format!("k{:05}", i))
            .bind(Utc::now())
            .execute(&*backend.db)
            .await
            .unwrap();
        }

        let keys: Vec<String> = backend.list().try_collect().await.unwrap();
        assert_eq!(keys.len(), total);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn presign_requires_existing_object() {
        let (backend, _dir) = test_backend().await;

        assert!(matches!(
            backend.presign_get("ghost.txt", Duration::from_secs(300)).await,
            Err(BackendError::ObjectNotFound { .. })
        ));

        put_text(&backend, "real.txt", "hi").await;
        let url = backend
            .presign_get("real.txt", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.contains("/download/real.txt?expires="));
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let (backend, _dir) = test_backend().await;

        for key in ["../etc/passwd", "a/../b", "./x", "/abs", "dir/", "a//b", "a\\b"] {
            assert!(matches!(
                backend.put(key, body_stream("x"), 1, None).await,
                Err(BackendError::InvalidObjectKey)
            ));
            backend.remove(key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dots_inside_a_segment_are_ordinary_characters() {
        let (backend, _dir) = test_backend().await;

        put_text(&backend, "report..final.txt", "done").await;
        put_text(&backend, "v1..2/.hidden", "h").await;

        assert_eq!(read_all(&backend, "report..final.txt").await, b"done");
        let keys: Vec<String> = backend.list().try_collect().await.unwrap();
        assert_eq!(keys, vec!["report..final.txt", "v1..2/.hidden"]);

        backend.remove("report..final.txt").await.unwrap();
        backend.remove("never..there.txt").await.unwrap();
        let keys: Vec<String> = backend.list().try_collect().await.unwrap();
        assert_eq!(keys, vec!["v1..2/.hidden"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_put_and_remove_agree_on_final_state() {
        let (backend, _dir) = test_backend().await;

        for _ in 0..50 {
            let writer = backend.clone();
            let deleter = backend.clone();
            let (put, removed) = tokio::join!(
                tokio::spawn(async move {
                    writer
                        .put("race.txt", body_stream("payload"), 7, None)
                        .await
                        .map(|_| ())
                }),
                tokio::spawn(async move { deleter.remove("race.txt").await }),
            );
            put.unwrap().unwrap();
            removed.unwrap().unwrap();

            let keys: Vec<String> = backend.list().try_collect().await.unwrap();
            match backend.get("race.txt").await {
                Ok(reader) => {
                    assert_eq!(keys, vec!["race.txt"]);
                    let chunks: Vec<_> = reader.body.try_collect().await.unwrap();
                    assert_eq!(chunks.concat(), b"payload");
                }
                Err(BackendError::ObjectNotFound { .. }) => assert!(keys.is_empty()),
                Err(err) => panic!("unexpected error: {}", err),
            }
        }
    }

    #[tokio::test]
    async fn failed_swap_restores_previous_payload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"old").await.unwrap();

        let backup = LocalBackend::link_backup(&path).await.unwrap();
        assert!(backup.is_some());
        let tmp = dir.path().join(".tmp-new");
        fs::write(&tmp, b"new").await.unwrap();
        fs::rename(&tmp, &path).await.unwrap();

        LocalBackend::restore_previous(&path, backup).await;
        assert_eq!(fs::read(&path).await.unwrap(), b"old");

        let fresh = dir.path().join("fresh.txt");
        let backup = LocalBackend::link_backup(&fresh).await.unwrap();
        assert!(backup.is_none());
        fs::write(&fresh, b"new").await.unwrap();
        LocalBackend::restore_previous(&fresh, backup).await;
        assert!(!fs::try_exists(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn subscription_filters_and_releases() {
        let (backend, _dir) = test_backend().await;
        let mut removed_only = backend
            .subscribe(&[EventType::ObjectRemoved])
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        put_text(&backend, "foo.txt", "x").await;
        backend.remove("foo.txt").await.unwrap();

        let notification = removed_only.next().await.unwrap().unwrap();
        assert_eq!(notification.records.len(), 1);
        assert_eq!(notification.records[0].event_name, "s3:ObjectRemoved:Delete");
        assert_eq!(notification.records[0].s3.object.key, "foo.txt");

        drop(removed_only);
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_error() {
        let (backend, _dir) = test_backend().await;
        let mut subscription = backend
            .subscribe(&[EventType::ObjectCreated])
            .await
            .unwrap();

        for i in 0..NOTIFICATION_CAPACITY + 1 {
            put_text(&backend, &format!("f{}", i), "x").await;
        }

        let first = subscription.next().await.unwrap();
        assert!(matches!(first, Err(BackendError::Subscription(_))));
    }
}
