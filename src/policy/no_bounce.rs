//! NoBounce: never move anything. All traffic is served from near.

use super::{BouncePolicy, BounceResult, PolicyContext, access};
use crate::config::PolicyKind;
use crate::errors::TierResult;
use crate::models::{Blob, BlobMetadata, TaggedEntry};
use crate::store::{ListOptions, ListPage};
use async_trait::async_trait;

pub struct NoBouncePolicy {
    ctx: PolicyContext,
}

impl NoBouncePolicy {
    pub fn new(ctx: PolicyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BouncePolicy for NoBouncePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::NoBounce
    }

    fn context(&self) -> &PolicyContext {
        &self.ctx
    }

    async fn reconcile_object(
        &self,
        _container: &str,
        _source: Option<&TaggedEntry>,
        _destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        Ok(BounceResult::NoOp)
    }

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        access::get_resolving(&self.ctx, container, name, false).await
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String> {
        access::put_direct(&self.ctx, self.ctx.near.as_ref(), container, blob).await
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> TierResult<Option<BlobMetadata>> {
        access::metadata_resolving(&self.ctx, container, name).await
    }

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()> {
        access::remove_near(&self.ctx, container, name).await
    }

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage> {
        access::merged_list(&self.ctx, container, options, false).await
    }
}
