//! Migration: drain the near store into the far store, one object at a
//! time. New writes land directly in the far store; reads and metadata
//! look in the far store first and fall back to the near one.

use super::{BouncePolicy, BounceResult, PolicyContext, access};
use crate::config::PolicyKind;
use crate::errors::{TierError, TierResult};
use crate::marker::ensure_client_name;
use crate::models::{Blob, BlobMetadata, Region, TaggedEntry, etags_equal};
use crate::store::{BlobStore, ListOptions, ListPage, copy_blob};
use async_trait::async_trait;
use tracing::{debug, warn};

pub struct MigrationPolicy {
    ctx: PolicyContext,
}

impl MigrationPolicy {
    pub fn new(ctx: PolicyContext) -> Self {
        Self { ctx }
    }

    fn checked_stores(&self) -> [&dyn BlobStore; 2] {
        [self.ctx.far.as_ref(), self.ctx.near.as_ref()]
    }

    async fn move_object(&self, container: &str, name: &str) -> TierResult<BounceResult> {
        debug!("migrating {}/{} to {}", container, name, self.ctx.far.id());
        if copy_blob(self.ctx.near.as_ref(), self.ctx.far.as_ref(), container, name)
            .await?
            .is_none()
        {
            return Err(TierError::MissingObject {
                container: container.to_string(),
                name: name.to_string(),
            });
        }
        self.ctx.near.remove_blob(container, name).await?;
        Ok(BounceResult::Move)
    }
}

#[async_trait]
impl BouncePolicy for MigrationPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Migration
    }

    fn context(&self) -> &PolicyContext {
        &self.ctx
    }

    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        _destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult> {
        let Some(source) = source else {
            return Ok(BounceResult::NoOp);
        };
        if source.metadata.is_directory() || source.region == Region::FarOnly {
            return Ok(BounceResult::NoOp);
        }

        let name = source.name();
        let near = self.ctx.near.blob_metadata(container, name).await?;
        let far = self.ctx.far.blob_metadata(container, name).await?;
        match (near, far) {
            (None, _) => Ok(BounceResult::NoOp),
            (Some(_), None) => self.move_object(container, name).await,
            (Some(near), Some(far)) if etags_equal(&near.etag, &far.etag) => {
                self.ctx.near.remove_blob(container, name).await?;
                Ok(BounceResult::Remove)
            }
            (Some(_), Some(_)) if source.has_pending_marker => {
                self.move_object(container, name).await
            }
            (Some(_), Some(_)) => {
                warn!("different objects with the same name: {}/{}", container, name);
                Ok(BounceResult::NoOp)
            }
        }
    }

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>> {
        ensure_client_name(name)?;
        let _guard = access::shared_lock(&self.ctx, container, name)?;
        for store in self.checked_stores() {
            if let Some(blob) = store.get_blob(container, name).await? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String> {
        access::put_direct(&self.ctx, self.ctx.far.as_ref(), container, blob).await
    }

    async fn blob_metadata(
        &self,
        container: &str,
        name: &str,
    ) -> TierResult<Option<BlobMetadata>> {
        ensure_client_name(name)?;
        for store in self.checked_stores() {
            if let Some(meta) = store.blob_metadata(container, name).await? {
                return Ok(Some(meta));
            }
        }
        Ok(None)
    }

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()> {
        ensure_client_name(name)?;
        let _guard = access::shared_lock(&self.ctx, container, name)?;
        for store in self.checked_stores() {
            store.remove_blob(container, name).await?;
        }
        Ok(())
    }

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage> {
        access::merged_list(&self.ctx, container, options, true).await
    }
}
