//! LastModifiedTime: a single age threshold. Objects older than
//! `evictDelay` are moved; there is no separate copy step.

use super::write_back::{WriteBackPolicy, enabled};
use super::{BouncePolicy, BounceResult, PolicyContext, access};
use crate::config::{PolicyKind, PolicySettings};
use crate::errors::TierResult;
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage};
use async_trait::async_trait;

pub struct LastModifiedTimePolicy {
    inner: WriteBackPolicy,
}

impl LastModifiedTimePolicy {
    pub fn new(ctx: PolicyContext, settings: &PolicySettings) -> TierResult<Self> {
        let evict_delay = settings.require_evict_delay()?;
        Ok(Self {
            inner: WriteBackPolicy::with_delays(ctx, None, enabled(evict_delay)),
        })
    }
}

#[async_trait]
impl BouncePolicy for LastModifiedTimePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LastModifiedTime
    }

    fn context(&self) -> &PolicyContext {
        self.inner.context()
    }

    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        if source.is_some_and(|source| source.is_link) {
            return Ok(BounceResult::NoOp);
        }
        self.inner.write_back(container, source, destination).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::{Harness, count};
    use crate::store::BlobStore;
    use chrono::Duration;

    #[tokio::test]
    async fn moves_only_after_threshold() {
        let settings = PolicySettings::new(PolicyKind::LastModifiedTime).evict_delay("P7D");
        let harness = Harness::new(settings).await;
        harness.policy.put_blob("c", Blob::from_bytes("k", "v")).await.unwrap();

        harness.clock.advance(Duration::days(6));
        let counts = harness.pass().await;
        assert_eq!(count(&counts, BounceResult::NoOp), 1);
        assert!(harness.far.blob_metadata("c", "k").await.unwrap().is_none());

        harness.clock.advance(Duration::days(1));
        assert_eq!(count(&harness.pass().await, BounceResult::Move), 1);
        assert!(harness.near_is_link("k").await);

        let counts = harness.pass().await;
        assert_eq!(count(&counts, BounceResult::NoOp), 1);
    }

    #[tokio::test]
    async fn threshold_is_required() {
        let clock = crate::clock::system_clock();
        let store = std::sync::Arc::new(crate::store::TransientStore::new("s"));
        let ctx = PolicyContext::standalone(store.clone(), store, clock);
        let settings = PolicySettings::new(PolicyKind::LastModifiedTime);
        assert!(LastModifiedTimePolicy::new(ctx, &settings).is_err());
    }
}
