//! Storage: keep the near store under a byte capacity.
//!
//! Before each pass the policy totals the near store and builds a
//! size-weighted histogram of last-modified days. Once the total reaches
//! the capacity, the oldest days are evicted until the overshoot is
//! covered. Below capacity the policy behaves like write-back.

use super::write_back::{WriteBackPolicy, enabled};
use super::{BouncePolicy, BounceResult, PolicyContext, access, ops};
use crate::config::{PolicyKind, PolicySettings};
use crate::errors::TierResult;
use crate::link::BounceLink;
use crate::marker::{INTERNAL_PREFIX, is_marker};
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage, crawl};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Cutoff that evicts nothing.
pub const EVICT_NOTHING: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;
/// Cutoff that evicts everything.
pub const EVICT_EVERYTHING: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageState {
    pub current_size: u64,
    /// Objects last modified on or before this day are evicted.
    pub eviction_time: DateTime<Utc>,
}

impl Default for StorageState {
    fn default() -> Self {
        Self {
            current_size: 0,
            eviction_time: EVICT_NOTHING,
        }
    }
}

pub fn day_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Whether a near listing entry occupies capacity.
pub(crate) fn occupies_capacity(meta: &BlobMetadata) -> bool {
    !is_marker(&meta.name)
        && !meta.name.starts_with(INTERNAL_PREFIX)
        && !meta.is_directory()
        && !BounceLink::is_link(meta)
}

/// Subtract bucket sizes, oldest first, until `deficit` goes negative and
/// return the bucket that got it there.
pub(crate) fn walk_buckets<K: Copy>(
    buckets: impl IntoIterator<Item = (K, u64)>,
    deficit: &mut i128,
) -> Option<K> {
    for (key, size) in buckets {
        *deficit -= i128::from(size);
        if *deficit < 0 {
            return Some(key);
        }
    }
    None
}

pub fn eviction_time(
    histogram: &BTreeMap<DateTime<Utc>, u64>,
    current_size: u64,
    capacity: u64,
) -> DateTime<Utc> {
    let mut deficit = i128::from(current_size) - i128::from(capacity);
    if deficit < 0 {
        return EVICT_NOTHING;
    }
    walk_buckets(histogram.iter().map(|(day, size)| (*day, *size)), &mut deficit)
        .unwrap_or(EVICT_EVERYTHING)
}

pub struct StoragePolicy {
    inner: WriteBackPolicy,
    capacity: u64,
    state: Mutex<StorageState>,
}

impl StoragePolicy {
    /// `capacity` is required; the write-back delays are optional and
    /// disabled when unset.
    pub fn new(ctx: PolicyContext, settings: &PolicySettings) -> TierResult<Self> {
        let capacity = settings.require_capacity()?;
        let copy_delay = settings.optional_copy_delay()?.and_then(enabled);
        let evict_delay = settings.optional_evict_delay()?.and_then(enabled);
        Ok(Self {
            inner: WriteBackPolicy::with_delays(ctx, copy_delay, evict_delay),
            capacity,
            state: Mutex::new(StorageState::default()),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn state(&self) -> StorageState {
        self.state.lock().clone()
    }

    pub(crate) fn set_state(&self, state: StorageState) {
        *self.state.lock() = state;
    }

    pub(crate) fn write_back(&self) -> &WriteBackPolicy {
        &self.inner
    }

    /// Stream the near store's capacity-occupying entries.
    pub(crate) fn near_entries(
        &self,
        container: &str,
    ) -> impl futures::Stream<Item = TierResult<BlobMetadata>> + Send + 'static {
        crawl(self.context().near.clone(), container, ListOptions::default())
            .map_err(Into::into)
            .try_filter(|meta| futures::future::ready(occupies_capacity(meta)))
    }

    /// Shared decision flow; `should_evict` picks the victims once the
    /// store is at or over capacity.
    pub(crate) async fn reconcile_with<F>(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
        should_evict: F,
    ) -> TierResult<BounceResult>
    where
        F: FnOnce(&TaggedEntry, &StorageState) -> bool + Send,
    {
        let Some(source) = source else {
            return self.inner.write_back(container, None, destination).await;
        };
        let state = self.state();
        if state.current_size < self.capacity || source.metadata.is_directory() {
            return self.inner.write_back(container, Some(source), destination).await;
        }
        if should_evict(source, &state) {
            return ops::maybe_move(self.context(), container, source, destination).await;
        }
        self.inner.write_back(container, Some(source), destination).await
    }
}

#[async_trait]
impl BouncePolicy for StoragePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Storage
    }

    fn context(&self) -> &PolicyContext {
        self.inner.context()
    }

    async fn prepare_bounce(&self, container: &str) -> TierResult<()> {
        let mut current_size = 0u64;
        let mut histogram: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();

        let mut entries = self.near_entries(container).boxed();
        while let Some(meta) = entries.try_next().await? {
            *histogram.entry(day_floor(meta.last_modified)).or_insert(0) += meta.size;
            current_size += meta.size;
        }

        let state = StorageState {
            current_size,
            eviction_time: eviction_time(&histogram, current_size, self.capacity),
        };
        debug!(
            "eviction time for {}: {} ({} of {} bytes used)",
            container, state.eviction_time, current_size, self.capacity
        );
        self.set_state(state);
        Ok(())
    }

    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        self.reconcile_with(container, source, destination, |source, state| {
            day_floor(source.metadata.last_modified) <= state.eviction_time
        })
        .await
    }

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        access::get_resolving(self.context(), container, name, true).await
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String> {
        self.inner.put(container, blob).await
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> TierResult<Option<BlobMetadata>> {
        access::metadata_resolving(self.context(), container, name).await
    }

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()> {
        self.inner.remove(container, name).await
    }

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage> {
        access::merged_list(self.context(), container, options, false).await
    }
}
