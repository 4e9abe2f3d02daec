//! Write-back: objects are copied to the far store once they are older
//! than `copyDelay` and replaced by a link once older than `evictDelay`.
//! Negative delays disable the step; zero makes it immediate.

use super::{BouncePolicy, BounceResult, PolicyContext, access, ops};
use crate::config::{PolicyKind, PolicySettings};
use crate::errors::TierResult;
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage};
use async_trait::async_trait;
use chrono::Duration;

/// `None` for a disabled (negative) delay.
pub(crate) fn enabled(delay: Duration) -> Option<Duration> {
    (delay >= Duration::zero()).then_some(delay)
}

pub struct WriteBackPolicy {
    ctx: PolicyContext,
    copy_delay: Option<Duration>,
    evict_delay: Option<Duration>,
}

impl WriteBackPolicy {
    /// Both delays are required.
    pub fn new(ctx: PolicyContext, settings: &PolicySettings) -> TierResult<Self> {
        let copy_delay = settings.require_copy_delay()?;
        let evict_delay = settings.require_evict_delay()?;
        Ok(Self::with_delays(ctx, enabled(copy_delay), enabled(evict_delay)))
    }

    pub fn with_delays(
        ctx: PolicyContext,
        copy_delay: Option<Duration>,
        evict_delay: Option<Duration>,
    ) -> Self {
        Self {
            ctx,
            copy_delay,
            evict_delay,
        }
    }

    pub fn copy_delay(&self) -> Option<Duration> {
        self.copy_delay
    }

    pub fn evict_delay(&self) -> Option<Duration> {
        self.evict_delay
    }

    /// True once `delay` has passed since the object was last modified.
    /// A delay reaching back before the calendar never expires.
    pub fn is_expired(&self, metadata: &BlobMetadata, delay: Duration) -> bool {
        self.ctx
            .clock
            .now()
            .checked_sub_signed(delay)
            .is_some_and(|cutoff| cutoff >= metadata.last_modified)
    }

    /// The write-back decision table.
    pub async fn write_back(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        let Some(source) = source else {
            return ops::maybe_remove_destination(&self.ctx, container, None, destination).await;
        };
        if source.metadata.is_directory() {
            return Ok(BounceResult::NoOp);
        }

        if let Some(evict) = self.evict_delay {
            if self.is_expired(&source.metadata, evict) {
                return ops::maybe_move(&self.ctx, container, source, destination).await;
            }
        }
        if let Some(copy) = self.copy_delay {
            if self.is_expired(&source.metadata, copy) {
                return ops::maybe_copy(&self.ctx, container, source, destination).await;
            }
        }
        Ok(BounceResult::NoOp)
    }

    /// Queue background reconciles for when the object comes due.
    pub fn schedule_reconcile(&self, container: &str, name: &str) {
        if let Some(copy) = self.copy_delay {
            access::enqueue_reconcile(&self.ctx, container, name, copy);
        }
        if let Some(evict) = self.evict_delay {
            if self.copy_delay != Some(evict) {
                access::enqueue_reconcile(&self.ctx, container, name, evict);
            }
        }
    }

    pub async fn put(&self, container: &str, blob: Blob) -> TierResult<String> {
        let name = blob.name().to_string();
        let etag = access::put_with_marker(&self.ctx, container, blob).await?;
        self.schedule_reconcile(container, &name);
        Ok(etag)
    }

    pub async fn remove(&self, container: &str, name: &str) -> TierResult<()> {
        access::remove_near(&self.ctx, container, name).await?;
        self.schedule_reconcile(container, name);
        Ok(())
    }
}

#[async_trait]
impl BouncePolicy for WriteBackPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::WriteBack
    }

    fn context(&self) -> &PolicyContext {
        &self.ctx
    }

    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        self.write_back(container, source, destination).await
    }

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        access::get_resolving(&self.ctx, container, name, true).await
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String> {
        self.put(container, blob).await
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> TierResult<Option<BlobMetadata>> {
        access::metadata_resolving(&self.ctx, container, name).await
    }

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()> {
        self.remove(container, name).await
    }

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage> {
        access::merged_list(&self.ctx, container, options, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::has_marker;
    use crate::models::Payload;
    use crate::models::blob::DIRECTORY_CONTENT_TYPE;
    use crate::policy::test_support::{Harness, count};
    use crate::store::BlobStore;

    fn settings(copy: &str, evict: &str) -> PolicySettings {
        PolicySettings::new(PolicyKind::WriteBack)
            .copy_delay(copy)
            .evict_delay(evict)
    }

    #[tokio::test]
    async fn negative_delays_disable_steps() {
        assert_eq!(enabled(Duration::seconds(-1)), None);
        assert_eq!(enabled(Duration::zero()), Some(Duration::zero()));
    }

    #[tokio::test]
    async fn delay_beyond_the_calendar_never_expires() {
        let harness = Harness::new(settings("-P1D", "-P1D")).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();
        let ctx = PolicyContext::standalone(
            harness.near.clone(),
            harness.far.clone(),
            harness.clock.clone(),
        );
        let policy = WriteBackPolicy::with_delays(ctx, None, Some(Duration::days(100_000_000)));

        let meta = harness.near.blob_metadata("c", "k").await.unwrap().unwrap();
        assert!(!policy.is_expired(&meta, Duration::days(100_000_000)));
        assert!(policy.is_expired(&meta, Duration::zero()));

        let source = crate::merge::tag_entry(meta, None, false);
        let result = policy.write_back("c", Some(&source), None).await.unwrap();
        assert_eq!(result, BounceResult::NoOp);
        assert!(!harness.near_is_link("k").await);
    }

    #[tokio::test]
    async fn copies_once_copy_delay_passes() {
        let harness = Harness::new(settings("PT1H", "-P1D")).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();

        let counts = harness.pass().await;
        assert_eq!(count(&counts, BounceResult::NoOp), 1);
        assert!(has_marker(harness.near.as_ref(), "c", "k").await.unwrap());

        harness.clock.advance(Duration::hours(1));
        let counts = harness.pass().await;
        assert_eq!(count(&counts, BounceResult::Copy), 1);
        assert!(!has_marker(harness.near.as_ref(), "c", "k").await.unwrap());
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evicts_once_evict_delay_passes() {
        let harness = Harness::new(settings("PT0S", "P1D")).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();

        assert_eq!(count(&harness.pass().await, BounceResult::Copy), 1);
        harness.clock.advance(Duration::days(1));
        assert_eq!(count(&harness.pass().await, BounceResult::Link), 1);
        assert!(harness.near_is_link("k").await);
        assert_eq!(harness.content("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn put_schedules_background_reconciles() {
        let harness = Harness::new(settings("PT0S", "P1D")).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();
        let scheduler = &harness.policy.context().scheduler;
        assert_eq!(scheduler.pending(), 2);

        assert_eq!(scheduler.run_due().await, 1);
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_some());
        assert!(!has_marker(harness.near.as_ref(), "c", "k").await.unwrap());

        harness.clock.advance(Duration::days(1));
        assert_eq!(scheduler.run_due().await, 1);
        assert!(harness.near_is_link("k").await);
    }

    #[tokio::test]
    async fn remove_propagates_to_far_store() {
        let harness = Harness::new(settings("PT0S", "-P1D")).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();
        harness.policy.context().scheduler.drain().await;
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_some());

        harness.policy.remove_blob("c", "k").await.unwrap();
        harness.policy.context().scheduler.drain().await;
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_none());
        assert!(harness.policy.get_blob("c", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn far_only_objects_are_removed() {
        let harness = Harness::new(settings("PT0S", "-P1D")).await;
        harness.far.put_blob("c", Blob::from_bytes("stale", "v")).await.unwrap();
        assert_eq!(count(&harness.pass().await, BounceResult::Remove), 1);
        assert!(harness.far.blob_metadata("c", "stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_placeholders_are_inert() {
        let harness = Harness::new(settings("PT0S", "PT0S")).await;
        let mut meta = BlobMetadata::new("dir/");
        meta.content_type = Some(DIRECTORY_CONTENT_TYPE.into());
        let source = TaggedEntry::new(meta, crate::models::Region::NearOnly);
        let result = harness
            .policy
            .reconcile_object("c", Some(&source), None)
            .await
            .unwrap();
        assert_eq!(result, BounceResult::NoOp);

        harness
            .near
            .put_blob("c", Blob::new(source.metadata.clone(), Payload::empty()))
            .await
            .unwrap();
        assert!(harness.pass().await.is_empty());
    }
}
