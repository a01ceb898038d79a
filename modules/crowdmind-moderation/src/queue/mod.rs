//! Per-thread comment queue.
//!
//! Two interchangeable backends implement [`QueueBackend`]: [`PgQueue`]
//! (durable, shared, survives restarts) and [`MemoryQueue`] (process
//! lifetime only). [`QueueStore`] picks one at startup and wraps it with a
//! per-call fallback so that accepting a comment never fails because the
//! durable backend is unreachable.

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crowdmind_common::{Config, ModerationError, QueueEntry, ThreadId};

/// Entries read from one backend, with a mark covering exactly those entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkedEntries {
    pub entries: Vec<QueueEntry>,
    /// Backend position of the newest entry read; `None` when nothing was.
    pub mark: Option<u64>,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn append(&self, thread_id: &ThreadId, entry: &QueueEntry) -> Result<()>;

    async fn length(&self, thread_id: &ThreadId) -> Result<usize>;

    /// Every live entry for the thread, oldest first, plus a mark for
    /// [`QueueBackend::clear_through`].
    async fn read_marked(&self, thread_id: &ThreadId) -> Result<MarkedEntries>;

    async fn read_all(&self, thread_id: &ThreadId) -> Result<Vec<QueueEntry>> {
        Ok(self.read_marked(thread_id).await?.entries)
    }

    async fn peek_oldest(&self, thread_id: &ThreadId) -> Result<Option<QueueEntry>>;

    /// `comment_index` of the most recently appended live entry.
    async fn newest_index(&self, thread_id: &ThreadId) -> Result<Option<usize>>;

    async fn clear(&self, thread_id: &ThreadId) -> Result<()>;

    /// Delete entries up to and including `mark`. Entries appended after the
    /// marked read survive.
    async fn clear_through(&self, thread_id: &ThreadId, mark: u64) -> Result<()>;

    /// Threads with at least one live entry.
    async fn active_threads(&self) -> Result<Vec<ThreadId>>;

    /// Expire the whole thread queue `ttl` from now unless it is cleared first.
    async fn set_retention(&self, thread_id: &ThreadId, ttl: Duration) -> Result<()>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// One complete read of a thread's queue, durable and parked entries merged.
/// Clearing it with [`QueueStore::clear_batch`] removes exactly these entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBatch {
    pub entries: Vec<QueueEntry>,
    durable: Option<u64>,
    parked: Option<u64>,
}

impl QueueBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Queue order is `comment_index` order; parked entries interleave by index.
fn merge(mut durable: Vec<QueueEntry>, parked: Vec<QueueEntry>) -> Vec<QueueEntry> {
    if !parked.is_empty() {
        durable.extend(parked);
        durable.sort_by_key(|e| e.comment_index);
    }
    durable
}

/// The queue as the rest of the pipeline sees it.
///
/// When a backend call fails, that single call is served by a local
/// in-process map instead. Entries parked there are never copied into the
/// backend; every read of the thread merges them back in and
/// [`QueueStore::clear_batch`] removes the ones a batch read, so the normal
/// batch routine drains them.
#[derive(Clone)]
pub struct QueueStore {
    backend: Arc<dyn QueueBackend>,
    fallback: Arc<MemoryQueue>,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            fallback: Arc::new(MemoryQueue::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryQueue::new()))
    }

    /// Select the backend for the life of the process: Postgres when
    /// `DATABASE_URL` is configured and reachable, in-process otherwise.
    pub async fn connect(config: &Config) -> Self {
        let Some(url) = config.database_url.as_deref() else {
            info!("No DATABASE_URL set, using in-process comment queue");
            return Self::in_memory();
        };

        let pool = match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "Could not connect to Postgres, using in-process comment queue");
                return Self::in_memory();
            }
        };

        let queue = PgQueue::new(pool);
        if let Err(e) = queue.migrate().await {
            warn!(error = %e, "Queue migrations failed, using in-process comment queue");
            return Self::in_memory();
        }

        info!("Using Postgres comment queue");
        Self::new(Arc::new(queue))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn append(&self, thread_id: &ThreadId, entry: QueueEntry) {
        if let Err(e) = self.backend.append(thread_id, &entry).await {
            warn!(
                thread_id = %thread_id,
                backend = self.backend.name(),
                error = %e,
                "Queue append failed, parking entry in local fallback"
            );
            self.fallback.push(thread_id, entry);
        }
    }

    pub async fn length(&self, thread_id: &ThreadId) -> usize {
        let durable = match self.backend.length(thread_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Queue length failed, counting local entries only");
                0
            }
        };
        durable + self.fallback.len(thread_id)
    }

    pub async fn read_all(&self, thread_id: &ThreadId) -> Vec<QueueEntry> {
        let entries = match self.backend.read_all(thread_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Queue read failed, reading local entries only");
                Vec::new()
            }
        };

        merge(entries, self.fallback.entries(thread_id))
    }

    /// Read the whole queue for a batch. Unlike [`QueueStore::read_all`], a
    /// backend failure is an error: a partial read must not be cleared.
    pub async fn read_batch(&self, thread_id: &ThreadId) -> Result<QueueBatch, ModerationError> {
        let durable = self
            .backend
            .read_marked(thread_id)
            .await
            .map_err(|e| ModerationError::Backend(e.to_string()))?;
        let parked = self.fallback.marked(thread_id);

        Ok(QueueBatch {
            entries: merge(durable.entries, parked.entries),
            durable: durable.mark,
            parked: parked.mark,
        })
    }

    /// Remove the entries of `batch`, leaving anything appended since.
    pub async fn clear_batch(&self, thread_id: &ThreadId, batch: &QueueBatch) {
        if let Some(mark) = batch.durable {
            if let Err(e) = self.backend.clear_through(thread_id, mark).await {
                warn!(thread_id = %thread_id, error = %e, "Queue drain failed, entries will be retried");
            }
        }
        if let Some(mark) = batch.parked {
            self.fallback.clear_through(thread_id, mark);
        }
    }

    /// `comment_index` of the newest queued entry, across both sources.
    pub async fn newest_index(&self, thread_id: &ThreadId) -> Option<usize> {
        let durable = match self.backend.newest_index(thread_id).await {
            Ok(index) => index,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Queue tail lookup failed, checking local entries only");
                None
            }
        };
        durable.max(self.fallback.newest_index(thread_id))
    }

    pub async fn peek_oldest(&self, thread_id: &ThreadId) -> Option<QueueEntry> {
        let durable = match self.backend.peek_oldest(thread_id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Queue peek failed, checking local entries only");
                None
            }
        };

        match (durable, self.fallback.oldest(thread_id)) {
            (Some(a), Some(b)) => Some(if b.enqueued_at < a.enqueued_at { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    pub async fn clear(&self, thread_id: &ThreadId) {
        if let Err(e) = self.backend.clear(thread_id).await {
            warn!(thread_id = %thread_id, error = %e, "Queue clear failed, entries will be retried");
        }
        self.fallback.clear(thread_id);
    }

    pub async fn active_threads(&self) -> Vec<ThreadId> {
        let mut threads: BTreeSet<ThreadId> = match self.backend.active_threads().await {
            Ok(threads) => threads.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Listing queued threads failed, using local entries only");
                BTreeSet::new()
            }
        };
        threads.extend(self.fallback.threads());
        threads.into_iter().collect()
    }

    pub async fn set_retention(&self, thread_id: &ThreadId, ttl: Duration) {
        if let Err(e) = self.backend.set_retention(thread_id, ttl).await {
            warn!(thread_id = %thread_id, error = %e, "Queue retention update failed, applying locally");
            self.fallback.expire_in(thread_id, ttl);
        }
    }

    pub async fn purge_expired(&self) {
        match self.backend.purge_expired().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Purged expired queue entries"),
            Err(e) => warn!(error = %e, "Purging expired queue entries failed"),
        }
    }
}
