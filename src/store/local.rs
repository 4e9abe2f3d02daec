//! src/store/local.rs
//!
//! LocalStore: a durable `BlobStore` backed by SQLite for metadata and
//! local disk for payloads sharded beneath
//! `base_path/{container}/{shard}/{shard}/{key}`. The binary opens one per
//! tier.

use super::{BlobStore, ListOptions, ListPage, MAX_LIST_KEYS, StoreError, StoreResult};
use crate::clock::{Clock, system_clock};
use crate::models::{Blob, BlobMetadata, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, pin_mut};
use md5::Context;
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const CONTAINER_NAME_MIN_LEN: usize = 3;
const CONTAINER_NAME_MAX_LEN: usize = 63;
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, FromRow)]
struct ContainerRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, FromRow)]
struct ObjectRow {
    key: String,
    etag: String,
    size_bytes: i64,
    content_type: Option<String>,
    content_encoding: Option<String>,
    content_language: Option<String>,
    content_disposition: Option<String>,
    content_md5: Option<Vec<u8>>,
    expires: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    user_metadata: String,
}

impl ObjectRow {
    fn into_metadata(self, container: &str) -> StoreResult<BlobMetadata> {
        let user_metadata: BTreeMap<String, String> = serde_json::from_str(&self.user_metadata)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
        Ok(BlobMetadata {
            container: container.to_string(),
            name: self.key,
            etag: self.etag,
            size: self.size_bytes.max(0) as u64,
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            content_language: self.content_language,
            content_disposition: self.content_disposition,
            content_md5: self.content_md5,
            expires: self.expires,
            created_at: Some(self.created_at),
            last_modified: self.last_modified,
            user_metadata,
        })
    }
}

const OBJECT_COLUMNS: &str = "key, etag, size_bytes, content_type, content_encoding, \
     content_language, content_disposition, content_md5, expires, created_at, \
     last_modified, user_metadata";

/// SQLite metadata plus sharded on-disk payloads.
#[derive(Clone)]
pub struct LocalStore {
    id: String,

    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(id: impl Into<String>, db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            db,
            base_path: base_path.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements for {}", statements.len(), self.id);
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = || StoreError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Container names follow the S3 bucket rules: 3-63 characters of
    /// lowercase letters, digits, dots and hyphens, starting and ending
    /// with a letter or digit.
    fn ensure_container_name_safe(&self, name: &str) -> StoreResult<()> {
        let invalid = |reason: &str| StoreError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(CONTAINER_NAME_MIN_LEN..=CONTAINER_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Two-level shard identifiers from MD5(container/key), to keep
    /// directory fan-out bounded.
    fn object_shards(container: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, key);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_container(&self, container: &str) -> StoreResult<ContainerRow> {
        self.ensure_container_name_safe(container)?;
        sqlx::query_as::<Sqlite, ContainerRow>("SELECT id, name FROM containers WHERE name = ?")
            .bind(container)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::ContainerNotFound(container.to_string()),
                other => StoreError::Sqlx(other),
            })
    }

    async fn fetch_object(
        &self,
        container: &ContainerRow,
        key: &str,
    ) -> StoreResult<Option<BlobMetadata>> {
        let row = sqlx::query_as::<Sqlite, ObjectRow>(&format!(
            "SELECT {} FROM objects WHERE key = ? AND container_id = ? AND is_deleted = 0",
            OBJECT_COLUMNS
        ))
        .bind(key)
        .bind(container.id)
        .fetch_optional(&*self.db)
        .await?;
        row.map(|row| row.into_metadata(&container.name))
            .transpose()
    }

    /// Recursively remove empty directories up to the container root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        self.ensure_container_name_safe(container)?;
        fs::create_dir_all(self.container_root(container)).await?;
        sqlx::query("INSERT OR IGNORE INTO containers (id, name, created_at) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4())
            .bind(container)
            .bind(self.clock.now())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Lists live objects in byte order of key (SQLite's BINARY collation).
    async fn list(&self, container: &str, options: &ListOptions) -> StoreResult<ListPage> {
        let container_rec = self.fetch_container(container).await?;
        let max_keys = options.max_keys.clamp(1, MAX_LIST_KEYS);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE container_id = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(container_rec.id);
        builder.push(" AND is_deleted = 0");

        if let Some(prefix) = &options.prefix {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.clone());
        }
        if let Some(after) = &options.after {
            builder.push(" AND key > ");
            builder.push_bind(after.clone());
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_marker = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_marker = rows.last().map(|row| row.key.clone());
        }

        let entries = rows
            .into_iter()
            .map(|row| row.into_metadata(&container_rec.name))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(ListPage {
            entries,
            next_marker,
        })
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> StoreResult<Option<BlobMetadata>> {
        self.ensure_key_safe(name)?;
        let container_rec = self.fetch_container(container).await?;
        self.fetch_object(&container_rec, name).await
    }

    /// Returns metadata plus a streaming reader over the payload file.
    async fn get_blob(&self, container: &str, name: &str) -> StoreResult<Option<Blob>> {
        self.ensure_key_safe(name)?;
        let container_rec = self.fetch_container(container).await?;
        let Some(metadata) = self.fetch_object(&container_rec, name).await? else {
            return Ok(None);
        };

        let file_path = self.object_path(&container_rec.name, name);
        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("metadata for {} exists but payload is missing", file_path.display());
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        let stream = ReaderStream::new(file).boxed();
        Ok(Some(Blob::new(metadata, Payload::from_stream(stream))))
    }

    /// Stream the payload to a temp file while hashing it, fsync, rename
    /// into place, then upsert the metadata row.
    async fn put_blob(&self, container: &str, blob: Blob) -> StoreResult<String> {
        let key = blob.metadata.name.clone();
        self.ensure_key_safe(&key)?;
        let container_rec = self.fetch_container(container).await?;

        let file_path = self.object_path(&container_rec.name, &key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        let stream = blob.payload.into_stream();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let digest = digest.compute();
        let etag = format!("{:x}", digest);
        let now = self.clock.now();
        let meta = blob.metadata;
        let user_metadata = serde_json::to_string(&meta.user_metadata)
            .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;

        let upsert = sqlx::query(
            r#"
            INSERT INTO objects (
                id, container_id, key, etag, size_bytes, content_type, content_encoding,
                content_language, content_disposition, content_md5, expires, created_at,
                last_modified, user_metadata, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(container_id, key) DO UPDATE SET
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                content_language = excluded.content_language,
                content_disposition = excluded.content_disposition,
                content_md5 = excluded.content_md5,
                expires = excluded.expires,
                created_at = CASE WHEN objects.is_deleted = 1
                    THEN excluded.created_at ELSE objects.created_at END,
                last_modified = excluded.last_modified,
                user_metadata = excluded.user_metadata,
                is_deleted = 0
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container_rec.id)
        .bind(&key)
        .bind(&etag)
        .bind(size_bytes)
        .bind(meta.content_type)
        .bind(meta.content_encoding)
        .bind(meta.content_language)
        .bind(meta.content_disposition)
        .bind(Some(digest.0.to_vec()))
        .bind(meta.expires)
        .bind(now)
        .bind(now)
        .bind(user_metadata)
        .execute(&*self.db)
        .await;

        match upsert {
            Ok(_) => Ok(etag),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    /// Soft-delete the row, then remove the payload and prune empty shards.
    async fn remove_blob(&self, container: &str, name: &str) -> StoreResult<()> {
        self.ensure_key_safe(name)?;
        let container_rec = self.fetch_container(container).await?;

        let result = sqlx::query(
            "UPDATE objects SET is_deleted = 1 WHERE key = ? AND container_id = ? AND is_deleted = 0",
        )
        .bind(name)
        .bind(container_rec.id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(());
        }

        let file_path = self.object_path(&container_rec.name, name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let container_root = self.container_root(&container_rec.name);
            self.prune_empty_dirs(parent, &container_root).await;
        }
        Ok(())
    }
}
