use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crowdmind_common::ThreadId;

/// Async locks keyed by record id, held around load-modify-save of that record.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Locks nobody holds or waits on can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Per-thread locks for thread records. Never held across a call to the
/// analysis service.
pub type ThreadLocks = KeyedLocks<ThreadId>;

/// Threads with a batch routine currently running.
#[derive(Default)]
pub struct InFlight {
    threads: Mutex<HashSet<ThreadId>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the thread, or `None` if another routine already holds it.
    pub fn try_claim(self: &Arc<Self>, thread_id: &ThreadId) -> Option<InFlightGuard> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        if !threads.insert(thread_id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            owner: Arc::clone(self),
            thread_id: thread_id.clone(),
        })
    }

    pub fn contains(&self, thread_id: &ThreadId) -> bool {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(thread_id)
    }
}

/// Releases the claim on drop, including when the routine panics.
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    thread_id: ThreadId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.thread_id);
    }
}
