//! In-memory store. Holds each container as a sorted map so listings come
//! back in byte order, exactly like the SQLite-backed store.

use super::{BlobStore, ListOptions, ListPage, MAX_LIST_KEYS, StoreError, StoreResult};
use crate::clock::{Clock, system_clock};
use crate::models::{Blob, BlobMetadata, Payload};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
};

struct StoredBlob {
    metadata: BlobMetadata,
    content: Bytes,
}

pub struct TransientStore {
    id: String,
    clock: Arc<dyn Clock>,
    page_size: usize,
    containers: RwLock<HashMap<String, BTreeMap<String, StoredBlob>>>,
}

impl TransientStore {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_clock(id, system_clock())
    }

    /// Stamp `last_modified` from `clock` instead of the system time.
    pub fn with_clock(id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: id.into(),
            clock,
            page_size: MAX_LIST_KEYS,
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Cap every listing page at `page_size` entries.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of blobs currently held in `container`, markers and links included.
    pub fn blob_count(&self, container: &str) -> usize {
        self.containers
            .read()
            .get(container)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn not_found(container: &str) -> StoreError {
        StoreError::ContainerNotFound(container.to_string())
    }
}

#[async_trait]
impl BlobStore for TransientStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        self.containers
            .write()
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn list(&self, container: &str, options: &ListOptions) -> StoreResult<ListPage> {
        let containers = self.containers.read();
        let blobs = containers
            .get(container)
            .ok_or_else(|| Self::not_found(container))?;

        let lower = match &options.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };
        let limit = options.max_keys.clamp(1, self.page_size);

        let mut entries = Vec::new();
        let mut truncated = false;
        for (name, stored) in blobs.range((lower, Bound::Unbounded)) {
            if let Some(prefix) = &options.prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if entries.len() == limit {
                truncated = true;
                break;
            }
            entries.push(stored.metadata.clone());
        }

        let next_marker = if truncated {
            entries.last().map(|meta: &BlobMetadata| meta.name.clone())
        } else {
            None
        };
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
        let containers = self.containers.read();
        let blobs = containers
            .get(container)
            .ok_or_else(|| Self::not_found(container))?;
        Ok(blobs.get(name).map(|stored| stored.metadata.clone()))
    }

    async fn get_blob(&self, container: &str, name: &str) -> StoreResult<Option<Blob>> {
        let containers = self.containers.read();
        let blobs = containers
            .get(container)
            .ok_or_else(|| Self::not_found(container))?;
        Ok(blobs.get(name).map(|stored| {
            Blob::new(
                stored.metadata.clone(),
                Payload::Buffered(stored.content.clone()),
            )
        }))
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> StoreResult<String> {
        if blob.metadata.name.is_empty() {
            return Err(StoreError::InvalidObjectKey(blob.metadata.name));
        }
        if !self.containers.read().contains_key(container) {
            return Err(Self::not_found(container));
        }

        let content = blob.payload.into_bytes().await?;
        let digest = md5::compute(&content);
        let now = self.clock.now();

        let mut metadata = blob.metadata;
        metadata.container = container.to_string();
        metadata.etag = format!("{:x}", digest);
        metadata.size = content.len() as u64;
        metadata.content_md5 = Some(digest.0.to_vec());
        metadata.created_at = Some(now);
        metadata.last_modified = now;
        let etag = metadata.etag.clone();

        let mut containers = self.containers.write();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Self::not_found(container))?;
        blobs.insert(metadata.name.clone(), StoredBlob { metadata, content });
        Ok(etag)
    }

    async fn remove_blob(&self, container: &str, name: &str) -> StoreResult<()> {
        let mut containers = self.containers.write();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| Self::not_found(container))?;
        blobs.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crawl;
    use futures::TryStreamExt;

    async fn store_with(names: &[&str]) -> Arc<TransientStore> {
        let store = Arc::new(TransientStore::new("mem").page_size(2));
        store.create_container("c").await.unwrap();
        for name in names {
            store
                .put_blob("c", Blob::from_bytes(*name, "x"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn list_pages_in_byte_order() {
        let store = store_with(&["b", "a", "c"]).await;
        let first = store.list("c", &ListOptions::default()).await.unwrap();
        let names: Vec<_> = first.entries.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        let options = ListOptions {
            after: first.next_marker,
            ..ListOptions::default()
        };
        let second = store.list("c", &options).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_marker.is_none());
    }

    #[tokio::test]
    async fn crawl_follows_markers_across_pages() {
        let store = store_with(&["e", "d", "c", "b", "a"]).await;
        let names: Vec<String> = crawl(store, "c", ListOptions::default())
            .map_ok(|meta| meta.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn crawl_skips_directory_placeholders() {
        let store = store_with(&["a"]).await;
        let mut dir = BlobMetadata::new("dir/");
        dir.content_type = Some(crate::models::blob::DIRECTORY_CONTENT_TYPE.into());
        store.put_blob("c", Blob::new(dir, Payload::empty())).await.unwrap();

        let names: Vec<String> = crawl(store, "c", ListOptions::default())
            .map_ok(|meta| meta.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, ["a"]);
    }

    #[tokio::test]
    async fn put_computes_md5_etag() {
        let store = store_with(&[]).await;
        let etag = store
            .put_blob("c", Blob::from_bytes("k", "hello"))
            .await
            .unwrap();
        assert_eq!(etag, "5d41402abc4b2a76b9719d911017c592");
        let meta = store.blob_metadata("c", "k").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.container, "c");
    }

    #[tokio::test]
    async fn missing_container_is_an_error() {
        let store = TransientStore::new("mem");
        let err = store.blob_metadata("nope", "k").await.unwrap_err();
        assert!(matches!(err, StoreError::ContainerNotFound(_)));
    }
}
