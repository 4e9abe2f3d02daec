//! Progress of one bounce pass over one container.
//!
//! Counters are atomics so status queries can read them while the pass is
//! still running; everything else sits behind short-lived mutexes.

use crate::policy::BounceResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

/// Object count and byte total of one side of a container.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub object_count: u64,
    pub total_size: u64,
}

/// Near and far occupancy after a pass.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub near: StoreStats,
    pub far: StoreStats,
}

/// Point-in-time copy of a [`TaskStatus`], for logs and JSON output.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub container: String,
    pub total: u64,
    pub copied: u64,
    pub moved: u64,
    pub linked: u64,
    pub removed: u64,
    pub errored: u64,
    pub requested_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub done: bool,
    pub error: Option<String>,
    pub stats: Option<ContainerStats>,
}

#[derive(Debug)]
pub struct TaskStatus {
    container: String,
    total: AtomicU64,
    copied: AtomicU64,
    moved: AtomicU64,
    linked: AtomicU64,
    removed: AtomicU64,
    errored: AtomicU64,
    aborted: AtomicBool,
    requested_at: DateTime<Utc>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    end_time: Mutex<Option<DateTime<Utc>>>,
    error: Mutex<Option<String>>,
    stats: Mutex<Option<ContainerStats>>,
    done: watch::Sender<bool>,
}

impl TaskStatus {
    pub fn new(container: impl Into<String>, requested_at: DateTime<Utc>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            container: container.into(),
            total: AtomicU64::new(0),
            copied: AtomicU64::new(0),
            moved: AtomicU64::new(0),
            linked: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            requested_at,
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            error: Mutex::new(None),
            stats: Mutex::new(None),
            done,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn copied(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }

    pub fn moved(&self) -> u64 {
        self.moved.load(Ordering::Relaxed)
    }

    pub fn linked(&self) -> u64 {
        self.linked.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Ask the pass to stop before its next object.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// When the worker picked the pass up; `None` while it is queued.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.lock()
    }

    pub fn stats(&self) -> Option<ContainerStats> {
        *self.stats.lock()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolve once the pass has finished, successfully or not.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            container: self.container.clone(),
            total: self.total(),
            copied: self.copied(),
            moved: self.moved(),
            linked: self.linked(),
            removed: self.removed(),
            errored: self.errored(),
            requested_at: self.requested_at,
            start_time: self.start_time(),
            end_time: self.end_time(),
            aborted: self.is_aborted(),
            done: self.is_done(),
            error: self.error(),
            stats: self.stats(),
        }
    }

    pub(crate) fn begin(&self, start_time: DateTime<Utc>) {
        *self.start_time.lock() = Some(start_time);
    }

    pub(crate) fn record(&self, result: BounceResult) {
        let counter = match result {
            BounceResult::NoOp => None,
            BounceResult::Copy => Some(&self.copied),
            BounceResult::Move => Some(&self.moved),
            BounceResult::Link => Some(&self.linked),
            BounceResult::Remove => Some(&self.removed),
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// A failure of the pass itself rather than of one object.
    pub(crate) fn fail(&self, message: String) {
        self.errored.fetch_add(1, Ordering::Relaxed);
        *self.error.lock() = Some(message);
        self.abort();
    }

    pub(crate) fn set_stats(&self, stats: ContainerStats) {
        *self.stats.lock() = Some(stats);
    }

    pub(crate) fn finish(&self, end_time: DateTime<Utc>) {
        *self.end_time.lock() = Some(end_time);
        self.done.send_replace(true);
    }
}
