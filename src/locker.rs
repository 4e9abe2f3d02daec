//! Per-object try-lock registry arbitrating background reconciliation
//! against live client traffic.
//!
//! Nothing here ever waits. A request either gets its lock immediately or
//! fails with [`TierError::Unavailable`] and the caller decides whether to
//! retry. Client requests take shared locks; reconciliation takes exclusive
//! ones.

use crate::errors::{TierError, TierResult};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::debug;

/// Most shared holders a single key can have at once.
pub const MAX_SHARED_HOLDERS: u32 = u16::MAX as u32;

type LockKey = (String, String);

#[derive(Debug)]
struct LockEntry {
    exclusive: bool,
    holders: u32,
}

#[derive(Default)]
pub struct ReconcileLocker {
    entries: Mutex<HashMap<LockKey, LockEntry>>,
}

impl ReconcileLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take the lock on `(container, name)`.
    pub fn lock(
        self: &Arc<Self>,
        container: &str,
        name: &str,
        exclusive: bool,
    ) -> TierResult<LockGuard> {
        let key = (container.to_string(), name.to_string());
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            None => {
                entries.insert(
                    key.clone(),
                    LockEntry {
                        exclusive,
                        holders: 1,
                    },
                );
            }
            Some(entry) => {
                if exclusive || entry.exclusive || entry.holders >= MAX_SHARED_HOLDERS {
                    debug!(
                        "lock contention on {}/{} (exclusive={}, held exclusive={}, holders={})",
                        container, name, exclusive, entry.exclusive, entry.holders
                    );
                    return Err(TierError::unavailable(container, name));
                }
                entry.holders += 1;
            }
        }
        Ok(LockGuard {
            locker: Arc::clone(self),
            key,
            exclusive,
        })
    }

    /// Number of keys currently locked.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    fn release(&self, key: &LockKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                entries.remove(key);
            }
        }
    }
}

/// Held lock; released on drop.
pub struct LockGuard {
    locker: Arc<ReconcileLocker>,
    key: LockKey,
    exclusive: bool,
}

impl LockGuard {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("container", &self.key.0)
            .field("name", &self.key.1)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locker.release(&self.key);
    }
}
