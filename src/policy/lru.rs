//! LRU: the storage policy, with recently read objects protected.
//!
//! Every read records `(container, name) -> (last access, size)`. When the
//! near store is over capacity, never-read objects are evicted oldest
//! modification day first, exactly as the storage policy does. Read
//! objects are only considered when that is not enough, and then in order
//! of last access.

use super::storage::{
    EVICT_EVERYTHING, EVICT_NOTHING, StoragePolicy, StorageState, day_floor, walk_buckets,
};
use super::{BouncePolicy, BounceResult, PolicyContext, access};
use crate::config::{PolicyKind, PolicySettings};
use crate::errors::TierResult;
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type AccessKey = (String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Default)]
struct Recency {
    accesses: HashMap<AccessKey, Access>,
    /// Read objects accessed on or before this instant are evicted.
    access_cutoff: Option<DateTime<Utc>>,
}

pub struct LruPolicy {
    storage: StoragePolicy,
    recency: Mutex<Recency>,
}

impl LruPolicy {
    pub fn new(ctx: PolicyContext, settings: &PolicySettings) -> TierResult<Self> {
        Ok(Self {
            storage: StoragePolicy::new(ctx, settings)?,
            recency: Mutex::new(Recency::default()),
        })
    }

    pub fn last_access(&self, container: &str, name: &str) -> Option<Access> {
        self.recency
            .lock()
            .accesses
            .get(&(container.to_string(), name.to_string()))
            .copied()
    }

    pub fn storage_state(&self) -> StorageState {
        self.storage.state()
    }

    fn touch(&self, container: &str, name: &str, size: u64) {
        let access = Access {
            at: self.context().clock.now(),
            size,
        };
        self.recency
            .lock()
            .accesses
            .insert((container.to_string(), name.to_string()), access);
    }

    fn forget(&self, container: &str, name: &str) {
        self.recency
            .lock()
            .accesses
            .remove(&(container.to_string(), name.to_string()));
    }

    /// A read on or after the eviction cutoff exempts the object; an older
    /// read leaves it to the modification-day check.
    fn should_evict(&self, container: &str, source: &TaggedEntry, state: &StorageState) -> bool {
        let recency = self.recency.lock();
        let key = (container.to_string(), source.name().to_string());
        match (recency.accesses.get(&key), recency.access_cutoff) {
            (Some(access), Some(cutoff)) => access.at <= cutoff,
            (Some(access), None) if access.at >= state.eviction_time => false,
            _ => day_floor(source.metadata.last_modified) <= state.eviction_time,
        }
    }
}

#[async_trait]
impl BouncePolicy for LruPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lru
    }

    fn context(&self) -> &PolicyContext {
        self.storage.context()
    }

    async fn prepare_bounce(&self, container: &str) -> TierResult<()> {
        let accesses = self.recency.lock().accesses.clone();
        let mut current_size = 0u64;
        let mut untracked: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        let mut tracked: Vec<(DateTime<Utc>, u64)> = Vec::new();

        let mut entries = self.storage.near_entries(container).boxed();
        while let Some(meta) = entries.try_next().await? {
            current_size += meta.size;
            match accesses.get(&(container.to_string(), meta.name.clone())) {
                Some(access) => tracked.push((access.at, meta.size)),
                None => {
                    *untracked.entry(day_floor(meta.last_modified)).or_insert(0) += meta.size;
                }
            }
        }

        let capacity = self.storage.capacity();
        let mut deficit = i128::from(current_size) - i128::from(capacity);
        let (eviction_time, access_cutoff) = if deficit < 0 {
            (EVICT_NOTHING, None)
        } else {
            match walk_buckets(untracked.iter().map(|(day, size)| (*day, *size)), &mut deficit) {
                Some(day) => (day, None),
                None => {
                    tracked.sort();
                    let cutoff = walk_buckets(tracked, &mut deficit).unwrap_or(EVICT_EVERYTHING);
                    (EVICT_EVERYTHING, Some(cutoff))
                }
            }
        };
        debug!(
            "eviction time for {}: {} (access cutoff {:?}, {} of {} bytes used)",
            container, eviction_time, access_cutoff, current_size, capacity
        );

        self.storage.set_state(StorageState {
            current_size,
            eviction_time,
        });
        self.recency.lock().access_cutoff = access_cutoff;
        Ok(())
    }

    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        self.storage
            .reconcile_with(container, source, destination, |source, state| {
                self.should_evict(container, source, state)
            })
            .await
    }

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        let blob = access::get_resolving(self.context(), container, name, true).await?;
        if let Some(blob) = &blob {
            self.touch(container, name, blob.metadata.size);
        }
        Ok(blob)
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String> {
        let name = blob.name().to_string();
        let etag = self.storage.write_back().put(container, blob).await?;
        self.forget(container, &name);
        Ok(etag)
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> TierResult<Option<BlobMetadata>> {
        let meta = access::metadata_resolving(self.context(), container, name).await?;
        if let Some(meta) = &meta {
            self.touch(container, name, meta.size);
        }
        Ok(meta)
    }

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()> {
        self.storage.write_back().remove(container, name).await?;
        self.forget(container, name);
        Ok(())
    }

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage> {
        self.storage.list(container, options).await
    }
}
