//! BounceLink: a pointer record left in the near store in place of content
//! that lives only in the far store.
//!
//! The link's payload is the complete metadata of the far object, encoded
//! as a small versioned JSON document. The near object carrying it is
//! flagged with [`LINK_METADATA_KEY`] in its user metadata, so spotting a
//! link never requires opening the payload.

use crate::errors::{TierError, TierResult};
use crate::models::{Blob, BlobMetadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User-metadata key that marks a near object as a link.
pub const LINK_METADATA_KEY: &str = "bounce-link";

const LINK_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    metadata: BlobMetadata,
}

/// Encoder/decoder for link records.
pub struct BounceLink;

impl BounceLink {
    /// Whether `metadata` describes a link. Looks only at user metadata.
    pub fn is_link(metadata: &BlobMetadata) -> bool {
        metadata.user_metadata.contains_key(LINK_METADATA_KEY)
    }

    pub fn encode(metadata: &BlobMetadata) -> TierResult<Bytes> {
        let envelope = Envelope {
            version: LINK_VERSION,
            metadata: metadata.clone(),
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|err| TierError::CorruptLink {
                name: metadata.name.clone(),
                reason: err.to_string(),
            })
    }

    /// Decode a link payload. `name` is only used to label errors.
    pub fn decode(name: &str, payload: &[u8]) -> TierResult<BlobMetadata> {
        let corrupt = |reason: String| TierError::CorruptLink {
            name: name.to_string(),
            reason,
        };
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|err| corrupt(err.to_string()))?;
        if envelope.version != LINK_VERSION {
            return Err(corrupt(format!("unsupported version {}", envelope.version)));
        }
        Ok(envelope.metadata)
    }

    /// Build the near-store blob standing in for `target`. The record is
    /// complete in memory before anything is written.
    pub fn to_blob(target: &BlobMetadata) -> TierResult<Blob> {
        let payload = Self::encode(target)?;
        let mut metadata = BlobMetadata::new(target.name.clone());
        metadata.container = target.container.clone();
        metadata.user_metadata = BTreeMap::from([(LINK_METADATA_KEY.to_string(), String::new())]);
        Ok(Blob::new(metadata, payload))
    }

    /// Read back the metadata a link blob points to.
    pub async fn from_blob(blob: Blob) -> TierResult<BlobMetadata> {
        let name = blob.metadata.name.clone();
        let payload = blob.payload.into_bytes().await?;
        Self::decode(&name, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn full_metadata() -> BlobMetadata {
        let mut meta = BlobMetadata::new("photos/cat.jpg");
        meta.container = "album".into();
        meta.etag = "\"0cc175b9c0f1b6a831c399e269772661\"".into();
        meta.size = 42;
        meta.content_type = Some("image/jpeg".into());
        meta.content_encoding = Some("gzip".into());
        meta.content_language = Some("en".into());
        meta.content_disposition = Some("attachment".into());
        meta.content_md5 = Some(vec![0x0c, 0xc1, 0x75, 0xb9]);
        meta.expires = Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        meta.created_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        meta.last_modified = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 15).unwrap();
        meta.user_metadata.insert("owner".into(), "alice".into());
        meta.user_metadata.insert("tier".into(), "gold".into());
        meta
    }

    #[test]
    fn encode_decode_preserves_every_field() {
        let meta = full_metadata();
        let bytes = BounceLink::encode(&meta).unwrap();
        assert_eq!(BounceLink::decode(&meta.name, &bytes).unwrap(), meta);
    }

    #[test]
    fn sparse_metadata_round_trips() {
        let meta = BlobMetadata::new("empty");
        let bytes = BounceLink::encode(&meta).unwrap();
        assert_eq!(BounceLink::decode("empty", &bytes).unwrap(), meta);
    }

    #[tokio::test]
    async fn link_blob_is_flagged_and_decodes() {
        let meta = full_metadata();
        let blob = BounceLink::to_blob(&meta).unwrap();
        assert!(BounceLink::is_link(&blob.metadata));
        assert_eq!(blob.name(), meta.name);
        assert_eq!(BounceLink::from_blob(blob).await.unwrap(), meta);
    }

    #[test]
    fn plain_metadata_is_not_a_link() {
        assert!(!BounceLink::is_link(&full_metadata()));
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let bytes = BounceLink::encode(&full_metadata()).unwrap();
        let err = BounceLink::decode("x", &bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, TierError::CorruptLink { .. }));
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let raw = br#"{"version":9,"metadata":{}}"#;
        let err = BounceLink::decode("x", raw).unwrap_err();
        assert!(matches!(err, TierError::CorruptLink { .. }));
    }
}
