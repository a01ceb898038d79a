use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crowdmind_common::{QueueEntry, ThreadId};

use super::{MarkedEntries, QueueBackend};

#[derive(Debug, Default)]
struct ThreadList {
    /// `(sequence, entry)`, sequence strictly increasing.
    entries: Vec<(u64, QueueEntry)>,
    expires_at: Option<Instant>,
}

impl ThreadList {
    fn is_live(&self, now: Instant) -> bool {
        !self.entries.is_empty() && self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process map of per-thread lists. Reset on restart.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<ThreadId, ThreadList>>,
    next_seq: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, ThreadList>> {
        // A panic while holding the lock cannot leave a list half-written.
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock the map after dropping this thread's list if it has expired or
    /// emptied.
    fn live(&self, thread_id: &ThreadId) -> MutexGuard<'_, HashMap<ThreadId, ThreadList>> {
        let mut lists = self.lock();
        let now = Instant::now();
        if lists.get(thread_id).is_some_and(|list| !list.is_live(now)) {
            lists.remove(thread_id);
        }
        lists
    }

    pub fn push(&self, thread_id: &ThreadId, entry: QueueEntry) {
        let mut lists = self.live(thread_id);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        lists
            .entry(thread_id.clone())
            .or_default()
            .entries
            .push((seq, entry));
    }

    pub fn len(&self, thread_id: &ThreadId) -> usize {
        self.live(thread_id)
            .get(thread_id)
            .map_or(0, |list| list.entries.len())
    }

    pub fn is_empty(&self, thread_id: &ThreadId) -> bool {
        self.len(thread_id) == 0
    }

    pub fn entries(&self, thread_id: &ThreadId) -> Vec<QueueEntry> {
        self.marked(thread_id).entries
    }

    /// Every live entry plus the sequence of the newest one.
    pub fn marked(&self, thread_id: &ThreadId) -> MarkedEntries {
        let lists = self.live(thread_id);
        let Some(list) = lists.get(thread_id) else {
            return MarkedEntries::default();
        };
        MarkedEntries {
            entries: list.entries.iter().map(|(_, e)| e.clone()).collect(),
            mark: list.entries.last().map(|(seq, _)| *seq),
        }
    }

    pub fn oldest(&self, thread_id: &ThreadId) -> Option<QueueEntry> {
        self.live(thread_id)
            .get(thread_id)
            .and_then(|list| list.entries.first().map(|(_, e)| e.clone()))
    }

    pub fn newest_index(&self, thread_id: &ThreadId) -> Option<usize> {
        self.live(thread_id)
            .get(thread_id)
            .and_then(|list| list.entries.last().map(|(_, e)| e.comment_index))
    }

    pub fn clear(&self, thread_id: &ThreadId) {
        self.lock().remove(thread_id);
    }

    /// Remove entries up to and including `mark`; later appends stay queued.
    pub fn clear_through(&self, thread_id: &ThreadId, mark: u64) {
        let mut lists = self.lock();
        if let Some(list) = lists.get_mut(thread_id) {
            list.entries.retain(|(seq, _)| *seq > mark);
            if list.entries.is_empty() {
                lists.remove(thread_id);
            }
        }
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        let mut lists = self.lock();
        let now = Instant::now();
        lists.retain(|_, list| list.is_live(now));
        lists.keys().cloned().collect()
    }

    pub fn expire_in(&self, thread_id: &ThreadId, ttl: Duration) {
        if let Some(list) = self.live(thread_id).get_mut(thread_id) {
            list.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn purge(&self) -> u64 {
        let mut lists = self.lock();
        let now = Instant::now();
        let mut removed = 0;
        lists.retain(|_, list| {
            let keep = list.is_live(now);
            if !keep {
                removed += list.entries.len() as u64;
            }
            keep
        });
        removed
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, thread_id: &ThreadId, entry: &QueueEntry) -> Result<()> {
        self.push(thread_id, entry.clone());
        Ok(())
    }

    async fn length(&self, thread_id: &ThreadId) -> Result<usize> {
        Ok(self.len(thread_id))
    }

    async fn read_marked(&self, thread_id: &ThreadId) -> Result<MarkedEntries> {
        Ok(self.marked(thread_id))
    }

    async fn peek_oldest(&self, thread_id: &ThreadId) -> Result<Option<QueueEntry>> {
        Ok(self.oldest(thread_id))
    }

    async fn newest_index(&self, thread_id: &ThreadId) -> Result<Option<usize>> {
        Ok(MemoryQueue::newest_index(self, thread_id))
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        MemoryQueue::clear(self, thread_id);
        Ok(())
    }

    async fn clear_through(&self, thread_id: &ThreadId, mark: u64) -> Result<()> {
        MemoryQueue::clear_through(self, thread_id, mark);
        Ok(())
    }

    async fn active_threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.threads())
    }

    async fn set_retention(&self, thread_id: &ThreadId, ttl: Duration) -> Result<()> {
        self.expire_in(thread_id, ttl);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.purge())
    }
}
