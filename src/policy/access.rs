//! Client-facing request handling shared by the policies: marker-first
//! puts, link-following reads with promotion back into the near store,
//! merged listings and delayed reconciliation.

use super::PolicyContext;
use crate::errors::TierResult;
use crate::link::BounceLink;
use crate::locker::LockGuard;
use crate::marker::{clear_marker, ensure_client_name, has_marker, write_marker};
use crate::merge::{MergeIterator, tag_entry};
use crate::models::{Blob, BlobMetadata, MergedEntry, Payload};
use crate::store::{BlobStore, ListOptions, ListPage, MAX_LIST_KEYS, copy_blob};
use bytes::Bytes;
use chrono::Duration;
use futures::{Stream, StreamExt, stream};
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub fn shared_lock(ctx: &PolicyContext, container: &str, name: &str) -> TierResult<LockGuard> {
    ctx.locker.lock(container, name, false)
}

/// Write the marker, then the object, both into the near store.
pub async fn put_with_marker(ctx: &PolicyContext, container: &str, blob: Blob) -> TierResult<String> {
    let name = blob.name().to_string();
    ensure_client_name(&name)?;
    let _guard = shared_lock(ctx, container, &name)?;
    write_marker(ctx.near.as_ref(), container, &name).await?;
    let etag = ctx.near.put_blob(container, blob).await?;
    debug!("put {}/{} to {} ({})", container, name, ctx.near.id(), etag);
    Ok(etag)
}

/// Put straight into `store`, no marker.
pub async fn put_direct(
    ctx: &PolicyContext,
    store: &dyn BlobStore,
    container: &str,
    blob: Blob,
) -> TierResult<String> {
    ensure_client_name(blob.name())?;
    let _guard = shared_lock(ctx, container, blob.name())?;
    Ok(store.put_blob(container, blob).await?)
}

pub async fn remove_near(ctx: &PolicyContext, container: &str, name: &str) -> TierResult<()> {
    ensure_client_name(name)?;
    let _guard = shared_lock(ctx, container, name)?;
    ctx.near.remove_blob(container, name).await?;
    Ok(())
}

/// Run `reconcile_name` for the object after `delay`. A no-op until the
/// context is bound to its policy.
pub fn enqueue_reconcile(ctx: &PolicyContext, container: &str, name: &str, delay: Duration) {
    let Some(policy) = ctx.policy() else {
        debug!("no bound policy, not scheduling {}/{}", container, name);
        return;
    };
    let weak = std::sync::Arc::downgrade(&policy);
    drop(policy);

    let container = container.to_string();
    let name = name.to_string();
    debug!("scheduling reconcile of {}/{} in {}", container, name, delay);
    ctx.scheduler.schedule(delay, async move {
        let Some(policy) = weak.upgrade() else {
            return;
        };
        match policy.reconcile_name(&container, &name).await {
            Ok(result) => debug!("background reconcile {}/{} -> {:?}", container, name, result),
            Err(err) if err.is_retryable() => {
                debug!("{}/{} busy, leaving it to the next pass", container, name)
            }
            Err(err) => warn!("background reconcile of {}/{} failed: {}", container, name, err),
        }
    });
}

/// Read an object, following a near-store link to the far store. With
/// `promote`, the far content is also written back into the near store.
pub async fn get_resolving(
    ctx: &PolicyContext,
    container: &str,
    name: &str,
    promote: bool,
) -> TierResult<Option<Blob>> {
    ensure_client_name(name)?;
    let near_blob = {
        let _guard = shared_lock(ctx, container, name)?;
        ctx.near.get_blob(container, name).await?
    };
    let Some(near_blob) = near_blob else {
        return Ok(None);
    };
    if !BounceLink::is_link(&near_blob.metadata) {
        return Ok(Some(near_blob));
    }

    if promote {
        if let Some(blob) = promote_link(ctx, container, name).await? {
            return Ok(Some(blob));
        }
    }
    debug!("serving {}/{} from {}", container, name, ctx.far.id());
    Ok(ctx.far.get_blob(container, name).await?)
}

/// Bring a linked object back into the near store. `None` means the
/// caller should read the far store itself.
async fn promote_link(ctx: &PolicyContext, container: &str, name: &str) -> TierResult<Option<Blob>> {
    let guard = match ctx.locker.lock(container, name, true) {
        Ok(guard) => guard,
        Err(err) if err.is_retryable() => {
            debug!("{}/{} busy, not promoting", container, name);
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    match ctx.near.blob_metadata(container, name).await? {
        Some(meta) if BounceLink::is_link(&meta) => {}
        Some(_) => return Ok(ctx.near.get_blob(container, name).await?),
        None => return Ok(None),
    }

    let far_blob = match ctx.far.get_blob(container, name).await {
        Ok(Some(blob)) => blob,
        Ok(None) => return Ok(None),
        Err(err) => {
            warn!(
                "streaming {}/{} from {} failed, copying instead: {}",
                container,
                name,
                ctx.far.id(),
                err
            );
            return double_copy(ctx, container, name).await;
        }
    };
    debug!("piping {}/{} from {} to {}", container, name, ctx.far.id(), ctx.near.id());
    Ok(Some(tee_into_near(ctx, container, far_blob, guard)))
}

/// Copy far to near in full, then read the near copy.
async fn double_copy(ctx: &PolicyContext, container: &str, name: &str) -> TierResult<Option<Blob>> {
    debug!("unbouncing {}/{} from {} to {}", container, name, ctx.far.id(), ctx.near.id());
    match copy_blob(ctx.far.as_ref(), ctx.near.as_ref(), container, name).await {
        Ok(Some(_)) => Ok(ctx.near.get_blob(container, name).await?),
        Ok(None) => Ok(None),
        Err(err) => {
            warn!("failed to unbounce {}/{}: {}", container, name, err);
            Ok(None)
        }
    }
}

/// Chunks the tee may run ahead of the near-store put before the reader waits.
const TEE_BUFFER_CHUNKS: usize = 16;

enum TeeChunk {
    Data(Bytes),
    End,
}

/// Hand the far stream to the caller while forwarding every chunk to a
/// background near-store put. The near put only succeeds if the caller
/// reads the stream to its end.
fn tee_into_near(ctx: &PolicyContext, container: &str, far_blob: Blob, guard: LockGuard) -> Blob {
    let (tx, rx) = mpsc::channel(TEE_BUFFER_CHUNKS);
    let metadata = far_blob.metadata;
    let reader = tee_stream(far_blob.payload.into_stream(), tx);

    let near = ctx.near.clone();
    let container = container.to_string();
    let copy = Blob::new(
        metadata.to_put_metadata(),
        Payload::from_stream(forwarded_stream(rx).boxed()),
    );
    tokio::spawn(async move {
        let _guard = guard;
        let name = copy.metadata.name.clone();
        match near.put_blob(&container, copy).await {
            Ok(etag) => debug!("promoted {}/{} into {} ({})", container, name, near.id(), etag),
            Err(err) => warn!("promotion of {}/{} failed, keeping the link: {}", container, name, err),
        }
    });

    Blob::new(metadata, Payload::from_stream(reader.boxed()))
}

/// A near put that falls behind holds the reader back; one that gives up
/// leaves the reader to finish on its own.
fn tee_stream<S>(
    inner: S,
    tx: mpsc::Sender<TeeChunk>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    stream::unfold(Some((inner, Some(tx))), |state| async move {
        let (mut inner, mut tx) = state?;
        match inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(sender) = &tx {
                    if sender.send(TeeChunk::Data(chunk.clone())).await.is_err() {
                        debug!("near copy went away, serving the rest of the read alone");
                        tx = None;
                    }
                }
                Some((Ok(chunk), Some((inner, tx))))
            }
            Some(Err(err)) => Some((Err(err), None)),
            None => {
                if let Some(sender) = tx {
                    let _ = sender.send(TeeChunk::End).await;
                }
                None
            }
        }
    })
}

fn forwarded_stream(
    rx: mpsc::Receiver<TeeChunk>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await {
            Some(TeeChunk::Data(chunk)) => Some((Ok(chunk), Some(rx))),
            Some(TeeChunk::End) => None,
            None => Some((
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "reader stopped before the end of the blob",
                )),
                None,
            )),
        }
    })
}

/// Metadata as a client sees it: a link resolves to the object it points to.
pub async fn metadata_resolving(
    ctx: &PolicyContext,
    container: &str,
    name: &str,
) -> TierResult<Option<BlobMetadata>> {
    ensure_client_name(name)?;
    match ctx.near.blob_metadata(container, name).await? {
        Some(meta) if BounceLink::is_link(&meta) => {
            let Some(link) = ctx.near.get_blob(container, name).await? else {
                return Ok(None);
            };
            Ok(Some(BounceLink::from_blob(link).await?))
        }
        other => Ok(other),
    }
}

/// Client listing over both stores. Markers are hidden and links show as
/// the far entry. Far-only names are included only when
/// `include_far_only` is set.
pub async fn merged_list(
    ctx: &PolicyContext,
    container: &str,
    options: &ListOptions,
    include_far_only: bool,
) -> TierResult<ListPage> {
    let crawl_options = ListOptions {
        prefix: options.prefix.clone(),
        after: options.after.clone(),
        max_keys: MAX_LIST_KEYS,
    };
    let mut merge = MergeIterator::new(ctx.near.clone(), ctx.far.clone(), container, crawl_options);
    let limit = options.max_keys.clamp(1, MAX_LIST_KEYS);

    let mut entries: Vec<BlobMetadata> = Vec::new();
    let mut next_marker = None;
    while let Some(entry) = merge.next().await? {
        let MergedEntry {
            source,
            destination,
        } = entry;
        let meta = match (source, destination) {
            (Some(source), _) => source.metadata,
            (None, Some(far)) if include_far_only => far,
            _ => continue,
        };
        if entries.len() == limit {
            next_marker = entries.last().map(|meta| meta.name.clone());
            break;
        }
        entries.push(meta);
    }
    Ok(ListPage {
        entries,
        next_marker,
    })
}

/// Tag one object from live metadata. A near marker without its object is
/// cleared on the way.
pub async fn live_entry(
    ctx: &PolicyContext,
    container: &str,
    name: &str,
) -> TierResult<Option<MergedEntry>> {
    let near = ctx.near.blob_metadata(container, name).await?;
    let marker = has_marker(ctx.near.as_ref(), container, name).await?;
    let far = ctx.far.blob_metadata(container, name).await?;

    match near {
        Some(near) if near.is_directory() => Ok(None),
        Some(near) => {
            let source = tag_entry(near, far.as_ref(), marker);
            Ok(Some(MergedEntry {
                source: Some(source),
                destination: far,
            }))
        }
        None => {
            if marker {
                clear_marker(ctx.near.as_ref(), container, name).await?;
            }
            Ok(far.map(|far| MergedEntry {
                source: None,
                destination: Some(far),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyKind, PolicySettings};
    use crate::errors::TierError;
    use crate::marker::marker_name;
    use crate::policy::test_support::Harness;
    use crate::store::{StoreError, StoreResult};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    /// Fails the first `failures` reads, then behaves like `inner`.
    struct FailingReads {
        inner: Arc<dyn BlobStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for FailingReads {
        fn id(&self) -> &str {
            self.inner.id()
        }

        async fn create_container(&self, container: &str) -> StoreResult<()> {
            self.inner.create_container(container).await
        }

        async fn list(&self, container: &str, options: &ListOptions) -> StoreResult<ListPage> {
            self.inner.list(container, options).await
        }

        async fn blob_metadata(
            &self,
            container: &str,
            name: &str,
        ) -> StoreResult<Option<BlobMetadata>> {
            self.inner.blob_metadata(container, name).await
        }

        async fn get_blob(&self, container: &str, name: &str) -> StoreResult<Option<Blob>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )));
            }
            self.inner.get_blob(container, name).await
        }

        async fn put_blob(&self, container: &str, blob: Blob) -> StoreResult<String> {
            self.inner.put_blob(container, blob).await
        }

        async fn remove_blob(&self, container: &str, name: &str) -> StoreResult<()> {
            self.inner.remove_blob(container, name).await
        }
    }

    #[tokio::test]
    async fn put_leaves_marker_next_to_object() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        put_with_marker(ctx, "c", Blob::from_bytes("k", "v")).await.unwrap();
        assert!(harness.near.blob_metadata("c", "k").await.unwrap().is_some());
        assert!(harness.near.blob_metadata("c", &marker_name("k")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_is_refused_while_reconciliation_holds_the_object() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        let _held = ctx.locker.lock("c", "k", true).unwrap();
        let err = put_with_marker(ctx, "c", Blob::from_bytes("k", "v")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(harness.near.blob_metadata("c", &marker_name("k")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserved_names_are_refused() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        let err = put_with_marker(ctx, "c", Blob::from_bytes(marker_name("k"), "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::IllegalName(_)));
        assert!(matches!(
            get_resolving(ctx, "c", ".bounce internal reserved prefix/x", false).await,
            Err(TierError::IllegalName(_))
        ));
    }

    #[tokio::test]
    async fn tee_promotes_link_while_serving_the_read() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        harness.far.put_blob("c", Blob::from_bytes("k", "far bytes")).await.unwrap();
        let far_meta = harness.far.blob_metadata("c", "k").await.unwrap().unwrap();
        harness.near.put_blob("c", BounceLink::to_blob(&far_meta).unwrap()).await.unwrap();

        let blob = get_resolving(ctx, "c", "k", true).await.unwrap().unwrap();
        assert_eq!(&blob.payload.into_bytes().await.unwrap()[..], b"far bytes");

        for _ in 0..100 {
            if ctx.locker.size() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let near_meta = harness.near.blob_metadata("c", "k").await.unwrap().unwrap();
        assert!(!BounceLink::is_link(&near_meta));
        assert_eq!(near_meta.etag, far_meta.etag);
    }

    #[tokio::test]
    async fn abandoned_read_keeps_the_link() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        harness.far.put_blob("c", Blob::from_bytes("k", "far bytes")).await.unwrap();
        let far_meta = harness.far.blob_metadata("c", "k").await.unwrap().unwrap();
        harness.near.put_blob("c", BounceLink::to_blob(&far_meta).unwrap()).await.unwrap();

        let blob = get_resolving(ctx, "c", "k", true).await.unwrap().unwrap();
        drop(blob);

        for _ in 0..100 {
            if ctx.locker.size() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(harness.near_is_link("k").await);
    }

    #[tokio::test]
    async fn link_metadata_resolves_to_target() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        harness.far.put_blob("c", Blob::from_bytes("k", "far bytes")).await.unwrap();
        let far_meta = harness.far.blob_metadata("c", "k").await.unwrap().unwrap();
        harness.near.put_blob("c", BounceLink::to_blob(&far_meta).unwrap()).await.unwrap();

        let meta = metadata_resolving(ctx, "c", "k").await.unwrap().unwrap();
        assert_eq!(meta, far_meta);
    }

    #[tokio::test]
    async fn merged_list_pages_and_hides_markers() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        let ctx = harness.policy.context();
        for name in ["a", "b", "c"] {
            put_with_marker(ctx, "c", Blob::from_bytes(name, "v")).await.unwrap();
        }
        harness.far.put_blob("c", Blob::from_bytes("d", "v")).await.unwrap();

        let options = ListOptions {
            max_keys: 2,
            ..ListOptions::default()
        };
        let page = merged_list(ctx, "c", &options, false).await.unwrap();
        let names: Vec<_> = page.entries.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(page.next_marker.as_deref(), Some("b"));

        let options = ListOptions {
            after: page.next_marker,
            ..ListOptions::default()
        };
        let page = merged_list(ctx, "c", &options, false).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_marker.is_none());

        let everything = merged_list(ctx, "c", &ListOptions::default(), true).await.unwrap();
        assert_eq!(everything.entries.len(), 4);
    }

    #[tokio::test]
    async fn failed_far_stream_falls_back_to_a_full_copy() {
        let harness = Harness::new(PolicySettings::new(PolicyKind::Copy)).await;
        harness.far.put_blob("c", Blob::from_bytes("k", "far bytes")).await.unwrap();
        let far_meta = harness.far.blob_metadata("c", "k").await.unwrap().unwrap();
        harness.near.put_blob("c", BounceLink::to_blob(&far_meta).unwrap()).await.unwrap();

        let far = Arc::new(FailingReads {
            inner: harness.far.clone(),
            failures: AtomicUsize::new(1),
        });
        let ctx = PolicyContext::standalone(harness.near.clone(), far, harness.clock.clone());

        let blob = get_resolving(&ctx, "c", "k", true).await.unwrap().unwrap();
        assert_eq!(&blob.payload.into_bytes().await.unwrap()[..], b"far bytes");
        assert!(!harness.near_is_link("k").await);
        assert_eq!(ctx.locker.size(), 0);
    }

    #[tokio::test]
    async fn tee_waits_for_a_slow_near_copy_and_outlives_a_lost_one() {
        let chunks: Vec<io::Result<Bytes>> = (0..TEE_BUFFER_CHUNKS + 2)
            .map(|i| Ok(Bytes::from(vec![i as u8])))
            .collect();
        let (tx, rx) = mpsc::channel(TEE_BUFFER_CHUNKS);
        let mut reader = Box::pin(tee_stream(stream::iter(chunks), tx));

        for _ in 0..TEE_BUFFER_CHUNKS {
            reader.next().await.unwrap().unwrap();
        }
        let stalled = tokio::time::timeout(StdDuration::from_millis(50), reader.next()).await;
        assert!(stalled.is_err());

        drop(rx);
        let rest: Vec<Bytes> = reader.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0][0], TEE_BUFFER_CHUNKS as u8);
    }
}
