//! Copy: mirror every near object into the far store as soon as it is
//! written. Content is never evicted from the near store.

use super::write_back::WriteBackPolicy;
use super::{BouncePolicy, BounceResult, PolicyContext, access, ops};
use crate::config::PolicyKind;
use crate::errors::TierResult;
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage};
use async_trait::async_trait;
use chrono::Duration;

pub struct CopyPolicy {
    inner: WriteBackPolicy,
}

impl CopyPolicy {
    pub fn new(ctx: PolicyContext) -> Self {
        Self {
            inner: WriteBackPolicy::with_delays(ctx, Some(Duration::zero()), None),
        }
    }
}

#[async_trait]
impl BouncePolicy for CopyPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Copy
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
        match source {
            Some(source) if source.metadata.is_directory() => Ok(BounceResult::NoOp),
            Some(source) => ops::maybe_copy(self.context(), container, source, destination).await,
            None => ops::maybe_remove_destination(self.context(), container, None, destination).await,
        }
    }

    /// Near always holds the content, so reads never touch the far store.
    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        access::get_resolving(self.context(), container, name, false).await
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
