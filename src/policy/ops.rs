//! The copy/move/remove building blocks every policy composes.
//!
//! Each helper re-reads live metadata before acting, so a decision made
//! from a listing that is already stale degrades into a no-op instead of
//! clobbering newer content.

use super::{BounceResult, PolicyContext};
use crate::errors::TierResult;
use crate::link::BounceLink;
use crate::models::{BlobMetadata, Region, TaggedEntry, etags_equal};
use crate::store::copy_blob;
use tracing::debug;

/// Replace the near object with a link to `target`.
pub async fn create_link(ctx: &PolicyContext, container: &str, target: &BlobMetadata) -> TierResult<()> {
    let link = BounceLink::to_blob(target)?;
    ctx.near.put_blob(container, link).await?;
    debug!("linked {}/{} to {}", container, target.name, ctx.far.id());
    Ok(())
}

/// Copy near to far unless the far store already has the same content.
pub async fn maybe_copy(
    ctx: &PolicyContext,
    container: &str,
    source: &TaggedEntry,
    _destination: Option<&BlobMetadata>,
) -> TierResult<BounceResult> {
    if source.region == Region::FarOnly || source.is_link {
        return Ok(BounceResult::NoOp);
    }

    let name = source.name();
    let near = ctx.near.blob_metadata(container, name).await?;
    let far = ctx.far.blob_metadata(container, name).await?;
    if let (Some(near), Some(far)) = (&near, &far) {
        if etags_equal(&near.etag, &far.etag) {
            return Ok(BounceResult::NoOp);
        }
    }

    match copy_blob(ctx.near.as_ref(), ctx.far.as_ref(), container, name).await? {
        Some(_) => Ok(BounceResult::Copy),
        None => Ok(BounceResult::NoOp),
    }
}

/// Leave only a link in the near store: link directly when the far store
/// already holds identical content, otherwise copy first.
pub async fn maybe_move(
    ctx: &PolicyContext,
    container: &str,
    source: &TaggedEntry,
    _destination: Option<&BlobMetadata>,
) -> TierResult<BounceResult> {
    if source.region == Region::FarOnly || source.is_link {
        return Ok(BounceResult::NoOp);
    }

    let name = source.name();
    if source.region == Region::Everywhere {
        let near = ctx.near.blob_metadata(container, name).await?;
        let far = ctx.far.blob_metadata(container, name).await?;
        if let (Some(near), Some(far)) = (&near, &far) {
            if !BounceLink::is_link(near) && etags_equal(&near.etag, &far.etag) {
                create_link(ctx, container, far).await?;
                return Ok(BounceResult::Link);
            }
        }
    }

    debug!("moving {}/{}", container, name);
    if copy_blob(ctx.near.as_ref(), ctx.far.as_ref(), container, name)
        .await?
        .is_none()
    {
        return Ok(BounceResult::NoOp);
    }
    let Some(far) = ctx.far.blob_metadata(container, name).await? else {
        return Ok(BounceResult::Copy);
    };
    create_link(ctx, container, &far).await?;
    Ok(BounceResult::Move)
}

/// Remove the far copy when the near object is gone, or when the near
/// object holds different content.
pub async fn maybe_remove_destination(
    ctx: &PolicyContext,
    container: &str,
    source: Option<&TaggedEntry>,
    destination: Option<&BlobMetadata>,
) -> TierResult<BounceResult> {
    let Some(destination) = destination else {
        return Ok(BounceResult::NoOp);
    };
    let stale = match source {
        None => true,
        Some(source) => !source.is_link && !etags_equal(&source.metadata.etag, &destination.etag),
    };
    if !stale {
        return Ok(BounceResult::NoOp);
    }
    debug!("removing {}/{} from {}", container, destination.name, ctx.far.id());
    ctx.far.remove_blob(container, &destination.name).await?;
    Ok(BounceResult::Remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyKind, PolicySettings};
    use crate::merge::tag_entry;
    use crate::models::Blob;
    use crate::policy::test_support::Harness;
    use crate::store::BlobStore;

    async fn harness_with(near: Option<&'static str>, far: Option<&'static str>) -> Harness {
        let harness = Harness::new(PolicySettings::new(PolicyKind::NoBounce)).await;
        if let Some(content) = near {
            harness.near.put_blob("c", Blob::from_bytes("k", content)).await.unwrap();
        }
        if let Some(content) = far {
            harness.far.put_blob("c", Blob::from_bytes("k", content)).await.unwrap();
        }
        harness
    }

    async fn entry(harness: &Harness) -> (Option<TaggedEntry>, Option<BlobMetadata>) {
        let near = harness.near.blob_metadata("c", "k").await.unwrap();
        let far = harness.far.blob_metadata("c", "k").await.unwrap();
        (near.map(|near| tag_entry(near, far.as_ref(), false)), far)
    }

    #[tokio::test]
    async fn copy_then_noop() {
        let harness = harness_with(Some("v"), None).await;
        let ctx = harness.policy.context();
        let (source, far) = entry(&harness).await;
        let source = source.unwrap();
        assert_eq!(
            maybe_copy(ctx, "c", &source, far.as_ref()).await.unwrap(),
            BounceResult::Copy
        );
        let (source, far) = entry(&harness).await;
        assert_eq!(
            maybe_copy(ctx, "c", &source.unwrap(), far.as_ref()).await.unwrap(),
            BounceResult::NoOp
        );
    }

    #[tokio::test]
    async fn move_copies_and_links() {
        let harness = harness_with(Some("v"), None).await;
        let ctx = harness.policy.context();
        let (source, far) = entry(&harness).await;
        assert_eq!(
            maybe_move(ctx, "c", &source.unwrap(), far.as_ref()).await.unwrap(),
            BounceResult::Move
        );
        assert!(harness.near_is_link("k").await);
        let far = harness.far.get_blob("c", "k").await.unwrap().unwrap();
        assert_eq!(&far.payload.into_bytes().await.unwrap()[..], b"v");
    }

    #[tokio::test]
    async fn move_of_identical_content_only_links() {
        let harness = harness_with(Some("v"), Some("v")).await;
        let ctx = harness.policy.context();
        let (source, far) = entry(&harness).await;
        let source = source.unwrap();
        assert_eq!(source.region, Region::Everywhere);
        assert_eq!(
            maybe_move(ctx, "c", &source, far.as_ref()).await.unwrap(),
            BounceResult::Link
        );

        let (source, far) = entry(&harness).await;
        assert_eq!(
            maybe_move(ctx, "c", &source.unwrap(), far.as_ref()).await.unwrap(),
            BounceResult::NoOp
        );
    }

    #[tokio::test]
    async fn remove_destination_rules() {
        let harness = harness_with(None, Some("v")).await;
        let ctx = harness.policy.context();
        let (_, far) = entry(&harness).await;
        assert_eq!(
            maybe_remove_destination(ctx, "c", None, far.as_ref()).await.unwrap(),
            BounceResult::Remove
        );
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_none());

        let harness = harness_with(Some("v"), Some("v")).await;
        let ctx = harness.policy.context();
        let (source, far) = entry(&harness).await;
        assert_eq!(
            maybe_remove_destination(ctx, "c", source.as_ref(), far.as_ref()).await.unwrap(),
            BounceResult::NoOp
        );

        let harness = harness_with(Some("new"), Some("old")).await;
        let ctx = harness.policy.context();
        let (source, far) = entry(&harness).await;
        assert_eq!(
            maybe_remove_destination(ctx, "c", source.as_ref(), far.as_ref()).await.unwrap(),
            BounceResult::Remove
        );
    }
}
