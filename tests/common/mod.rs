#![allow(dead_code)]

use bounce_tier::clock::ManualClock;
use bounce_tier::config::PolicySettings;
use bounce_tier::link::BounceLink;
use bounce_tier::models::Blob;
use bounce_tier::policy::{BouncePolicy, PolicyContext, build_policy};
use bounce_tier::services::{BounceService, TaskStatus};
use bounce_tier::store::{BlobStore, TransientStore};
use chrono::{TimeZone, Utc};
use std::sync::Arc;

pub const CONTAINER: &str = "container";

/// Two transient tiers, a manual clock and a service managing one container.
pub struct Tiers {
    pub near: Arc<TransientStore>,
    pub far: Arc<TransientStore>,
    pub clock: Arc<ManualClock>,
    pub policy: Arc<dyn BouncePolicy>,
    pub service: Arc<BounceService>,
}

impl Tiers {
    pub async fn new(settings: PolicySettings) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let near = Arc::new(TransientStore::with_clock("near", clock.clone()));
        let far = Arc::new(TransientStore::with_clock("far", clock.clone()));
        near.create_container(CONTAINER).await.unwrap();
        far.create_container(CONTAINER).await.unwrap();

        let ctx = PolicyContext::standalone(near.clone(), far.clone(), clock.clone());
        let policy = build_policy(&settings, ctx).unwrap();
        let service = BounceService::new();
        service.register(CONTAINER, policy.clone());
        Self {
            near,
            far,
            clock,
            policy,
            service,
        }
    }

    pub async fn put(&self, name: &str, content: impl Into<Vec<u8>>) {
        let blob = Blob::from_bytes(name, content.into());
        self.policy.put_blob(CONTAINER, blob).await.unwrap();
    }

    /// Read through the policy, following links.
    pub async fn read(&self, name: &str) -> Option<Vec<u8>> {
        let blob = self.policy.get_blob(CONTAINER, name).await.unwrap()?;
        Some(blob.payload.into_bytes().await.unwrap().to_vec())
    }

    pub async fn bounce(&self) -> Arc<TaskStatus> {
        let status = self.service.bounce(CONTAINER).unwrap();
        status.wait().await;
        status
    }

    pub async fn near_is_link(&self, name: &str) -> bool {
        self.near
            .blob_metadata(CONTAINER, name)
            .await
            .unwrap()
            .is_some_and(|meta| BounceLink::is_link(&meta))
    }

    pub async fn far_content(&self, name: &str) -> Option<Vec<u8>> {
        let blob = self.far.get_blob(CONTAINER, name).await.unwrap()?;
        Some(blob.payload.into_bytes().await.unwrap().to_vec())
    }
}
