//! Delay-capable background task queue.
//!
//! Tasks are futures with a due time measured on an injectable [`Clock`].
//! A dispatcher started with [`BackgroundScheduler::start`] runs them as
//! they come due. Tests usually never start it and instead call
//! [`BackgroundScheduler::drain`] or [`BackgroundScheduler::run_due`] to
//! run queued work at a point of their choosing.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

/// Longest the dispatcher sleeps before re-reading the clock.
const MAX_IDLE: StdDuration = StdDuration::from_millis(250);

struct Pending {
    due: DateTime<Utc>,
    seq: u64,
    task: BoxFuture<'static, ()>,
}

pub struct BackgroundScheduler {
    clock: Arc<dyn Clock>,
    queue: Mutex<Vec<Pending>>,
    paused: AtomicBool,
    seq: AtomicU64,
    completed: AtomicUsize,
    wakeup: Notify,
}

impl BackgroundScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            queue: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            completed: AtomicUsize::new(0),
            wakeup: Notify::new(),
        })
    }

    /// Queue `task` to run once `delay` has elapsed. Negative delays run as
    /// soon as possible; a due time past the calendar is clamped to its end.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = delay.max(Duration::zero());
        let pending = Pending {
            due: self
                .clock
                .now()
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task: task.boxed(),
        };
        self.queue.lock().push(pending);
        self.wakeup.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Tasks run to completion so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Stop dispatching. Queued tasks stay queued.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wakeup.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Run every queued task now, in due order, regardless of due time or
    /// pause state. Tasks queued by the drained tasks run too.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = self.take_where(|_| true);
            if batch.is_empty() {
                return ran;
            }
            ran += self.run_batch(batch).await;
        }
    }

    /// Run the tasks whose due time has passed, unless paused.
    pub async fn run_due(&self) -> usize {
        if self.is_paused() {
            return 0;
        }
        let now = self.clock.now();
        let batch = self.take_where(|pending| pending.due <= now);
        self.run_batch(batch).await
    }

    /// Poll until at least `count` tasks have completed or `timeout` passes.
    pub async fn busy_wait_for(&self, count: usize, timeout: StdDuration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.completed() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }

    /// Spawn the dispatcher. It exits once the scheduler is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(scheduler) = weak.upgrade() else {
                    debug!("scheduler dropped, dispatcher exiting");
                    return;
                };
                scheduler.run_due().await;
                let idle = scheduler.next_wait();
                let notified = scheduler.wakeup.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        })
    }

    fn next_wait(&self) -> StdDuration {
        if self.is_paused() {
            return MAX_IDLE;
        }
        let now = self.clock.now();
        self.queue
            .lock()
            .iter()
            .map(|pending| pending.due)
            .min()
            .and_then(|due| (due - now).to_std().ok())
            .map(|wait| wait.min(MAX_IDLE))
            .unwrap_or(MAX_IDLE)
    }

    fn take_where(&self, mut keep: impl FnMut(&Pending) -> bool) -> Vec<Pending> {
        let mut queue = self.queue.lock();
        let (mut taken, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *queue).into_iter().partition(|p| keep(p));
        *queue = rest;
        taken.sort_by_key(|pending| (pending.due, pending.seq));
        taken
    }

    async fn run_batch(&self, batch: Vec<Pending>) -> usize {
        let count = batch.len();
        for pending in batch {
            pending.task.await;
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        count
    }
}
