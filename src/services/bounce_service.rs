//! BounceService: runs reconciliation passes, one at a time.
//!
//! Each container is registered with the policy that manages it. A bounce
//! request queues a pass on the single worker task; requests for a
//! container whose pass is still queued or running get that pass's status
//! back instead of a new one.

use super::task_status::{ContainerStats, StoreStats, TaskStatus};
use crate::errors::{TierError, TierResult};
use crate::marker::{INTERNAL_PREFIX, clear_marker, is_marker};
use crate::merge::MergeIterator;
use crate::models::{BlobMetadata, MergedEntry};
use crate::policy::storage::occupies_capacity;
use crate::policy::{self, BouncePolicy, PolicyContext};
use crate::store::{BlobStore, ListOptions, StoreResult, crawl};
use futures::TryStreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct Job {
    policy: Arc<dyn BouncePolicy>,
    status: Arc<TaskStatus>,
}

pub struct BounceService {
    policies: RwLock<HashMap<String, Arc<dyn BouncePolicy>>>,
    statuses: Mutex<HashMap<String, Arc<TaskStatus>>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl BounceService {
    /// Spawns the worker, so this must run inside a tokio runtime. The
    /// worker exits once the service is dropped and its queue is empty.
    pub fn new() -> Arc<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(worker(queue));
        Arc::new(Self {
            policies: RwLock::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            jobs,
        })
    }

    /// Manage `container` with `policy`, replacing any previous policy.
    pub fn register(&self, container: &str, policy: Arc<dyn BouncePolicy>) {
        info!("container {} uses the {:?} policy", container, policy.kind());
        self.policies.write().insert(container.to_string(), policy);
    }

    pub fn policy(&self, container: &str) -> Option<Arc<dyn BouncePolicy>> {
        self.policies.read().get(container).cloned()
    }

    pub fn bounce(&self, container: &str) -> TierResult<Arc<TaskStatus>> {
        let policy = self.policy(container).ok_or_else(|| {
            TierError::Precondition(format!("no policy registered for container `{}`", container))
        })?;

        let mut statuses = self.statuses.lock();
        if let Some(status) = statuses.get(container) {
            if !status.is_done() {
                debug!("bounce of {} already in flight", container);
                return Ok(status.clone());
            }
        }

        let status = Arc::new(TaskStatus::new(container, policy.context().clock.now()));
        let job = Job {
            policy,
            status: status.clone(),
        };
        if self.jobs.send(job).is_err() {
            return Err(TierError::Precondition("bounce worker has stopped".into()));
        }
        statuses.insert(container.to_string(), status.clone());
        Ok(status)
    }

    /// Latest pass for `container`, finished or not.
    pub fn status(&self, container: &str) -> Option<Arc<TaskStatus>> {
        self.statuses.lock().get(container).cloned()
    }

    pub fn statuses(&self) -> Vec<Arc<TaskStatus>> {
        let mut all: Vec<_> = self.statuses.lock().values().cloned().collect();
        all.sort_by(|a, b| a.container().cmp(b.container()));
        all
    }

    /// Stop the container's unfinished pass before its next object.
    /// Returns whether there was such a pass.
    pub fn abort(&self, container: &str) -> bool {
        match self.status(container) {
            Some(status) if !status.is_done() => {
                info!("aborting bounce of {}", container);
                status.abort();
                true
            }
            _ => false,
        }
    }
}

async fn worker(mut queue: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = queue.recv().await {
        run_pass(job.policy, job.status).await;
    }
    debug!("bounce worker stopped");
}

async fn run_pass(policy: Arc<dyn BouncePolicy>, status: Arc<TaskStatus>) {
    let container = status.container().to_string();
    let ctx = policy.context();
    status.begin(ctx.clock.now());
    info!("bounce of {} started ({:?})", container, policy.kind());

    if let Err(err) = reconcile_container(policy.as_ref(), &container, &status).await {
        error!("bounce of {} failed: {}", container, err);
        status.fail(err.to_string());
    }

    match container_stats(ctx, &container).await {
        Ok(stats) => status.set_stats(stats),
        Err(err) => warn!("could not collect stats for {}: {}", container, err),
    }
    status.finish(ctx.clock.now());

    let snapshot = status.snapshot();
    info!(
        "bounce of {} finished: {} objects, {} copied, {} moved, {} linked, {} removed, {} errors{}",
        container,
        snapshot.total,
        snapshot.copied,
        snapshot.moved,
        snapshot.linked,
        snapshot.removed,
        snapshot.errored,
        if snapshot.aborted { " (aborted)" } else { "" }
    );
}

async fn reconcile_container(
    policy: &dyn BouncePolicy,
    container: &str,
    status: &TaskStatus,
) -> TierResult<()> {
    let ctx = policy.context();
    policy.prepare_bounce(container).await?;

    let mut merge = MergeIterator::new(
        ctx.near.clone(),
        ctx.far.clone(),
        container,
        ListOptions::default(),
    );
    while !status.is_aborted() {
        let Some(entry) = merge.next().await? else {
            break;
        };
        reconcile_entry(policy, container, &entry, status).await;
    }

    for name in merge.take_orphan_markers() {
        clear_orphan_marker(ctx, container, &name).await;
    }
    Ok(())
}

/// Failures are counted against the object; the pass carries on.
async fn reconcile_entry(
    policy: &dyn BouncePolicy,
    container: &str,
    entry: &MergedEntry,
    status: &TaskStatus,
) {
    let name = entry.name();
    let _guard = match policy.context().locker.lock(container, name, true) {
        Ok(guard) => guard,
        Err(err) => {
            warn!("skipping {}/{}: {}", container, name, err);
            status.record_error();
            return;
        }
    };

    match policy::reconcile(policy, container, entry).await {
        Ok(result) => status.record(result),
        Err(err) => {
            warn!("failed to reconcile {}/{}: {}", container, name, err);
            status.record_error();
        }
    }
}

async fn clear_orphan_marker(ctx: &PolicyContext, container: &str, name: &str) {
    let Ok(_guard) = ctx.locker.lock(container, name, true) else {
        debug!("{}/{} is busy, leaving its marker", container, name);
        return;
    };
    match ctx.near.blob_metadata(container, name).await {
        Ok(None) => {
            debug!("clearing orphan marker for {}/{}", container, name);
            if let Err(err) = clear_marker(ctx.near.as_ref(), container, name).await {
                warn!("failed to clear marker for {}/{}: {}", container, name, err);
            }
        }
        Ok(Some(_)) => {}
        Err(err) => warn!("failed to look up {}/{}: {}", container, name, err),
    }
}

async fn container_stats(ctx: &PolicyContext, container: &str) -> StoreResult<ContainerStats> {
    Ok(ContainerStats {
        near: store_stats(ctx.near.clone(), container, occupies_capacity).await?,
        far: store_stats(ctx.far.clone(), container, |meta| {
            !is_marker(&meta.name) && !meta.name.starts_with(INTERNAL_PREFIX)
        })
        .await?,
    })
}

async fn store_stats(
    store: Arc<dyn BlobStore>,
    container: &str,
    counts: fn(&BlobMetadata) -> bool,
) -> StoreResult<StoreStats> {
    crawl(store, container, ListOptions::default())
        .try_fold(StoreStats::default(), |mut stats, meta| async move {
            if counts(&meta) {
                stats.object_count += 1;
                stats.total_size += meta.size;
            }
            Ok(stats)
        })
        .await
}
