//! Tiering policies.
//!
//! A policy decides, per merged entry, what to do with one object
//! ([`BouncePolicy::reconcile_object`]) and intercepts client traffic so
//! that puts leave markers, reads follow links, and so on. The decision
//! tables live in the per-policy modules; the helpers they compose live in
//! [`ops`] and [`access`].

pub mod access;
pub mod copy;
pub mod last_modified;
pub mod lru;
pub mod migration;
pub mod no_bounce;
pub mod ops;
pub mod storage;
pub mod write_back;

use crate::clock::Clock;
use crate::config::{PolicyKind, PolicySettings};
use crate::errors::{TierError, TierResult};
use crate::locker::ReconcileLocker;
use crate::marker::clear_marker;
use crate::models::{Blob, BlobMetadata, MergedEntry, Region, TaggedEntry};
use crate::scheduler::BackgroundScheduler;
use crate::store::{BlobStore, ListOptions, ListPage};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

pub use copy::CopyPolicy;
pub use last_modified::LastModifiedTimePolicy;
pub use lru::LruPolicy;
pub use migration::MigrationPolicy;
pub use no_bounce::NoBouncePolicy;
pub use storage::StoragePolicy;
pub use write_back::WriteBackPolicy;

/// Outcome of reconciling one object. Exactly one per call.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BounceResult {
    NoOp,
    Copy,
    Move,
    Remove,
    Link,
}

/// Everything a policy needs besides its own settings.
pub struct PolicyContext {
    pub near: Arc<dyn BlobStore>,
    pub far: Arc<dyn BlobStore>,
    pub locker: Arc<ReconcileLocker>,
    pub scheduler: Arc<BackgroundScheduler>,
    pub clock: Arc<dyn Clock>,
    this: OnceLock<Weak<dyn BouncePolicy>>,
}

impl PolicyContext {
    pub fn new(
        near: Arc<dyn BlobStore>,
        far: Arc<dyn BlobStore>,
        locker: Arc<ReconcileLocker>,
        scheduler: Arc<BackgroundScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            near,
            far,
            locker,
            scheduler,
            clock,
            this: OnceLock::new(),
        }
    }

    /// Fresh locker and a scheduler on the same clock.
    pub fn standalone(
        near: Arc<dyn BlobStore>,
        far: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = BackgroundScheduler::new(clock.clone());
        Self::new(near, far, ReconcileLocker::new(), scheduler, clock)
    }

    /// The policy owning this context, once [`build_policy`] has bound it.
    pub fn policy(&self) -> Option<Arc<dyn BouncePolicy>> {
        self.this.get().and_then(Weak::upgrade)
    }

    fn bind(&self, policy: &Arc<dyn BouncePolicy>) {
        if self.this.set(Arc::downgrade(policy)).is_err() {
            debug!("policy context already bound");
        }
    }
}

#[async_trait]
pub trait BouncePolicy: Send + Sync {
    fn kind(&self) -> PolicyKind;

    fn context(&self) -> &PolicyContext;

    /// Recompute per-pass state before the first object of a pass.
    async fn prepare_bounce(&self, _container: &str) -> TierResult<()> {
        Ok(())
    }

    /// Decide and apply the action for one object. At least one of
    /// `source` and `destination` is present.
    async fn reconcile_object(
        &self,
        container: &str,
        source: Option<&TaggedEntry>,
        destination: Option<&BlobMetadata>,
    ) -> TierResult<BounceResult>;

    async fn get_blob(&self, container: &str, name: &str) -> TierResult<Option<Blob>>;

    async fn put_blob(&self, container: &str, blob: Blob) -> TierResult<String>;

    async fn blob_metadata(&self, container: &str, name: &str)
    -> TierResult<Option<BlobMetadata>>;

    async fn remove_blob(&self, container: &str, name: &str) -> TierResult<()>;

    async fn list(&self, container: &str, options: &ListOptions) -> TierResult<ListPage>;

    /// Reconcile one object from live metadata, under the exclusive lock.
    async fn reconcile_name(&self, container: &str, name: &str) -> TierResult<BounceResult> {
        let ctx = self.context();
        let _guard = ctx.locker.lock(container, name, true)?;
        match access::live_entry(ctx, container, name).await? {
            Some(entry) => reconcile(self, container, &entry).await,
            None => Ok(BounceResult::NoOp),
        }
    }
}

/// Apply `policy` to one merged entry, then clear the entry's marker once
/// its content has landed.
pub async fn reconcile<P>(policy: &P, container: &str, entry: &MergedEntry) -> TierResult<BounceResult>
where
    P: BouncePolicy + ?Sized,
{
    if entry.source.is_none() && entry.destination.is_none() {
        return Err(TierError::Precondition(
            "reconcile called with neither a source nor a destination".into(),
        ));
    }

    let source = entry.source.as_ref();
    let result = policy
        .reconcile_object(container, source, entry.destination.as_ref())
        .await?;
    debug!("{}/{} -> {:?}", container, entry.name(), result);

    if let Some(source) = source {
        let landed = matches!(
            result,
            BounceResult::Copy | BounceResult::Move | BounceResult::Link
        );
        let settled = result == BounceResult::NoOp && source.region == Region::Everywhere;
        if source.has_pending_marker && (landed || settled) {
            if let Err(err) = clear_marker(policy.context().near.as_ref(), container, source.name()).await {
                warn!("failed to clear marker for {}/{}: {}", container, source.name(), err);
            }
        }
    }
    Ok(result)
}

/// Build the policy named by `settings`. Configuration errors surface
/// here, before any object is touched.
pub fn build_policy(
    settings: &PolicySettings,
    ctx: PolicyContext,
) -> TierResult<Arc<dyn BouncePolicy>> {
    let policy: Arc<dyn BouncePolicy> = match settings.kind {
        PolicyKind::NoBounce => Arc::new(NoBouncePolicy::new(ctx)),
        PolicyKind::Copy => Arc::new(CopyPolicy::new(ctx)),
        PolicyKind::Migration => Arc::new(MigrationPolicy::new(ctx)),
        PolicyKind::WriteBack => Arc::new(WriteBackPolicy::new(ctx, settings)?),
        PolicyKind::LastModifiedTime => Arc::new(LastModifiedTimePolicy::new(ctx, settings)?),
        PolicyKind::Storage => Arc::new(StoragePolicy::new(ctx, settings)?),
        PolicyKind::Lru => Arc::new(LruPolicy::new(ctx, settings)?),
    };
    policy.context().bind(&policy);
    Ok(policy)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::merge::MergeIterator;
    use crate::store::TransientStore;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    pub struct Harness {
        pub near: Arc<TransientStore>,
        pub far: Arc<TransientStore>,
        pub clock: Arc<ManualClock>,
        pub policy: Arc<dyn BouncePolicy>,
    }

    impl Harness {
        pub async fn new(settings: PolicySettings) -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
            let near = Arc::new(TransientStore::with_clock("near", clock.clone()));
            let far = Arc::new(TransientStore::with_clock("far", clock.clone()));
            near.create_container("c").await.unwrap();
            far.create_container("c").await.unwrap();
            let ctx = PolicyContext::standalone(near.clone(), far.clone(), clock.clone());
            let policy = build_policy(&settings, ctx).unwrap();
            Self {
                near,
                far,
                clock,
                policy,
            }
        }

        /// One full pass without the service: prepare, merge, reconcile.
        pub async fn pass(&self) -> HashMap<BounceResult, usize> {
            self.policy.prepare_bounce("c").await.unwrap();
            let mut merge =
                MergeIterator::new(self.near.clone(), self.far.clone(), "c", ListOptions::default());
            let mut counts = HashMap::new();
            while let Some(entry) = merge.next().await.unwrap() {
                let result = reconcile(self.policy.as_ref(), "c", &entry).await.unwrap();
                *counts.entry(result).or_insert(0) += 1;
            }
            counts
        }

        pub async fn content(&self, name: &str) -> Option<Vec<u8>> {
            let blob = self.policy.get_blob("c", name).await.unwrap()?;
            Some(blob.payload.into_bytes().await.unwrap().to_vec())
        }

        pub async fn near_is_link(&self, name: &str) -> bool {
            self.near
                .blob_metadata("c", name)
                .await
                .unwrap()
                .map(|meta| crate::link::BounceLink::is_link(&meta))
                .unwrap_or(false)
        }
    }

    pub fn count(counts: &HashMap<BounceResult, usize>, result: BounceResult) -> usize {
        counts.get(&result).copied().unwrap_or(0)
    }
}
