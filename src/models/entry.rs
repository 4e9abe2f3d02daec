//! Entries produced by merging a near listing with a far listing.

use super::blob::BlobMetadata;
use serde::Serialize;

/// Which stores hold an ETag-identical copy of an object's content.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Region {
    NearOnly,
    FarOnly,
    Everywhere,
}

/// A near-side listing entry tagged with its region.
///
/// Built fresh by every merge pass and consumed by one reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedEntry {
    /// The entry that represents the object's content: the near entry, or
    /// the far entry when the near copy is only a BounceLink.
    pub metadata: BlobMetadata,

    pub region: Region,

    /// A marker for this name was found next to it in the near listing.
    pub has_pending_marker: bool,

    /// Both stores hold the name with differing content and no pending put
    /// explains the difference.
    pub conflict: bool,

    /// The near object is a BounceLink.
    pub is_link: bool,
}

impl TaggedEntry {
    pub fn new(metadata: BlobMetadata, region: Region) -> Self {
        Self {
            metadata,
            region,
            has_pending_marker: false,
            conflict: false,
            is_link: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// One emitted element of a merge pass.
///
/// `source` is absent when the near store does not hold the name at all;
/// `destination` is the far store's entry, if any. At least one is present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedEntry {
    pub source: Option<TaggedEntry>,
    pub destination: Option<BlobMetadata>,
}

impl MergedEntry {
    pub fn name(&self) -> &str {
        match (&self.source, &self.destination) {
            (Some(source), _) => source.name(),
            (None, Some(destination)) => &destination.name,
            (None, None) => "",
        }
    }

    pub fn region(&self) -> Region {
        self.source
            .as_ref()
            .map(|source| source.region)
            .unwrap_or(Region::FarOnly)
    }
}
