//! Sorted merge-join of a near listing and a far listing.
//!
//! Both sides are crawled lazily, a page at a time, so memory stays bounded
//! by the two page buffers. Every name present on either side is emitted
//! exactly once, in ascending byte order. Markers never surface as entries
//! of their own: a marker of an emitted name sets `has_pending_marker` on
//! that entry, and any other marker is remembered as an orphan for the
//! caller to clean up.
//!
//! A marker normally follows its base name directly. Names such as `"a "`
//! sort between `"a"` and the marker of `"a"`; for those the marker is
//! looked up by name in the near store and skipped when the listing
//! reaches it.

use crate::errors::{TierError, TierResult};
use crate::link::BounceLink;
use crate::marker::{INTERNAL_PREFIX, is_marker, marker_name, strip_suffix};
use crate::models::{BlobMetadata, MergedEntry, Region, TaggedEntry, etags_equal};
use crate::store::{BlobStore, ListOptions, StoreResult, crawl};
use futures::{StreamExt, stream::BoxStream};
use std::{cmp::Ordering, collections::HashSet, sync::Arc};
use tracing::debug;

/// Tag a near entry against the far entry of the same name.
///
/// A near link stands for the far object, so the far entry becomes the
/// representative and the region is `FarOnly`. Differing content is a
/// conflict unless a pending put explains it.
pub fn tag_entry(near: BlobMetadata, far: Option<&BlobMetadata>, has_marker: bool) -> TaggedEntry {
    let is_link = BounceLink::is_link(&near);
    let mut entry = match far {
        Some(far) if is_link => TaggedEntry::new(far.clone(), Region::FarOnly),
        Some(far) if etags_equal(&near.etag, &far.etag) => {
            TaggedEntry::new(near, Region::Everywhere)
        }
        Some(_) => {
            let mut entry = TaggedEntry::new(near, Region::NearOnly);
            entry.conflict = !has_marker;
            entry
        }
        None => TaggedEntry::new(near, Region::NearOnly),
    };
    entry.is_link = is_link;
    entry.has_pending_marker = has_marker;
    entry
}

struct Side {
    store: String,
    stream: BoxStream<'static, StoreResult<BlobMetadata>>,
    peeked: Option<BlobMetadata>,
    last: Option<String>,
}

impl Side {
    fn new(store: String, stream: BoxStream<'static, StoreResult<BlobMetadata>>) -> Self {
        Self {
            store,
            stream,
            peeked: None,
            last: None,
        }
    }

    /// Look at the next entry, verifying the listing is strictly ascending.
    async fn peek(&mut self) -> TierResult<Option<&BlobMetadata>> {
        while self.peeked.is_none() {
            let Some(item) = self.stream.next().await else {
                return Ok(None);
            };
            let meta = item?;
            if let Some(previous) = &self.last {
                if meta.name.as_bytes() <= previous.as_bytes() {
                    return Err(TierError::UnsortedListing {
                        store: self.store.clone(),
                        previous: previous.clone(),
                        name: meta.name,
                    });
                }
            }
            self.last = Some(meta.name.clone());
            if meta.name.starts_with(INTERNAL_PREFIX) {
                continue;
            }
            self.peeked = Some(meta);
        }
        Ok(self.peeked.as_ref())
    }

    async fn peek_name(&mut self) -> TierResult<Option<String>> {
        Ok(self.peek().await?.map(|meta| meta.name.clone()))
    }

    fn take(&mut self) -> Option<BlobMetadata> {
        self.peeked.take()
    }
}

pub struct MergeIterator {
    near: Side,
    far: Side,
    /// Near store and container for markers that are not adjacent.
    near_lookup: Option<(Arc<dyn BlobStore>, String)>,
    /// Markers already attributed by lookup, still ahead in the listing.
    claimed_markers: HashSet<String>,
    orphan_markers: Vec<String>,
}

impl MergeIterator {
    pub fn new(
        near: Arc<dyn BlobStore>,
        far: Arc<dyn BlobStore>,
        container: &str,
        options: ListOptions,
    ) -> Self {
        let near_id = near.id().to_string();
        let far_id = far.id().to_string();
        let mut merge = Self::from_streams(
            near_id,
            crawl(near.clone(), container, options.clone()).boxed(),
            far_id,
            crawl(far, container, options).boxed(),
        );
        merge.near_lookup = Some((near, container.to_string()));
        merge
    }

    pub fn from_streams(
        near_id: String,
        near: BoxStream<'static, StoreResult<BlobMetadata>>,
        far_id: String,
        far: BoxStream<'static, StoreResult<BlobMetadata>>,
    ) -> Self {
        Self {
            near: Side::new(near_id, near),
            far: Side::new(far_id, far),
            near_lookup: None,
            claimed_markers: HashSet::new(),
            orphan_markers: Vec::new(),
        }
    }

    /// Base names of markers seen without their base object directly
    /// before them. Drains the list.
    pub fn take_orphan_markers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.orphan_markers)
    }

    pub async fn next(&mut self) -> TierResult<Option<MergedEntry>> {
        while let Some(name) = self.near.peek_name().await? {
            if !is_marker(&name) {
                break;
            }
            self.near.take();
            if self.claimed_markers.remove(&name) {
                continue;
            }
            debug!("orphan marker for {}", strip_suffix(&name));
            self.orphan_markers.push(strip_suffix(&name).to_string());
        }

        let near_name = self.near.peek_name().await?;
        let far_name = self.far.peek_name().await?;
        let ordering = match (&near_name, &far_name) {
            (None, None) => return Ok(None),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(near), Some(far)) => near.as_bytes().cmp(far.as_bytes()),
        };

        let entry = match ordering {
            Ordering::Less => {
                let Some(near) = self.near.take() else {
                    return Ok(None);
                };
                let marker = self.take_marker_for(&near.name).await?;
                MergedEntry {
                    source: Some(tag_entry(near, None, marker)),
                    destination: None,
                }
            }
            Ordering::Equal => {
                let (Some(near), Some(far)) = (self.near.take(), self.far.take()) else {
                    return Ok(None);
                };
                let marker = self.take_marker_for(&near.name).await?;
                MergedEntry {
                    source: Some(tag_entry(near, Some(&far), marker)),
                    destination: Some(far),
                }
            }
            Ordering::Greater => MergedEntry {
                source: None,
                destination: self.far.take(),
            },
        };
        Ok(Some(entry))
    }

    async fn take_marker_for(&mut self, name: &str) -> TierResult<bool> {
        let expected = marker_name(name);
        match self.near.peek().await? {
            Some(next) if next.name == expected => {
                self.near.take();
                Ok(true)
            }
            Some(next) if next.name.as_bytes() < expected.as_bytes() => {
                self.lookup_marker(expected).await
            }
            _ => Ok(false),
        }
    }

    /// Other names sit between `expected`'s base and `expected` itself.
    async fn lookup_marker(&mut self, expected: String) -> TierResult<bool> {
        let Some((store, container)) = &self.near_lookup else {
            return Ok(false);
        };
        if store.blob_metadata(container, &expected).await?.is_none() {
            return Ok(false);
        }
        debug!("found non-adjacent marker {}", expected);
        self.claimed_markers.insert(expected);
        Ok(true)
    }
}
