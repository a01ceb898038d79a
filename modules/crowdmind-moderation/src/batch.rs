use std::sync::Arc;

use ai_client::truncate_to_char_boundary;
use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crowdmind_common::{ModerationError, QueueEntry, ThreadId};

use crate::analyzer::{AnalysisService, ThreadContext};
use crate::locks::{InFlight, ThreadLocks};
use crate::queue::QueueStore;
use crate::response::{parse_batch, BatchResult};
use crate::store::ThreadStore;
use crate::trigger::{TriggerPolicy, TriggerReason};

/// How much of an unparseable reply goes into the log.
const LOGGED_REPLY_BYTES: usize = 500;

/// What one run of the batch routine did to a thread's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Another batch for the thread was still running; nothing was touched.
    InFlight,
    /// The queue was already drained.
    Empty,
    /// The thread no longer exists; its queue was cleared.
    ThreadMissing,
    /// The thread store failed; the queue is kept for the next sweep.
    StoreFailed,
    /// The queue could not be read in full; nothing was analysed or removed.
    QueueUnavailable,
    /// The analysis call failed; the queue is kept for the next sweep.
    ServiceFailed,
    /// The reply could not be parsed; the batch was dropped from the queue anyway.
    Malformed,
    /// Results were written and the batch removed from the queue. Comments
    /// queued while it ran stay for the next sweep. `skipped` counts entries
    /// with no usable result or whose comment no longer exists.
    Applied { analyzed: usize, skipped: usize },
}

/// Drains per-thread queues into single analysis calls.
pub struct BatchProcessor {
    queue: QueueStore,
    threads: Arc<dyn ThreadStore>,
    analyzer: Arc<dyn AnalysisService>,
    policy: TriggerPolicy,
    locks: Arc<ThreadLocks>,
    in_flight: Arc<InFlight>,
}

impl BatchProcessor {
    pub fn new(
        queue: QueueStore,
        threads: Arc<dyn ThreadStore>,
        analyzer: Arc<dyn AnalysisService>,
        policy: TriggerPolicy,
        locks: Arc<ThreadLocks>,
    ) -> Self {
        Self {
            queue,
            threads,
            analyzer,
            policy,
            locks,
            in_flight: Arc::new(InFlight::new()),
        }
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    pub fn is_processing(&self, thread_id: &ThreadId) -> bool {
        self.in_flight.contains(thread_id)
    }

    /// Evaluate the trigger policy against the thread's current queue.
    pub async fn trigger_reason(&self, thread_id: &ThreadId) -> Option<TriggerReason> {
        let length = self.queue.length(thread_id).await;
        if length == 0 {
            return None;
        }
        // The age check only matters below the size threshold.
        let oldest = if length < self.policy.size_threshold {
            self.queue.peek_oldest(thread_id).await
        } else {
            None
        };
        self.policy.evaluate(length, oldest.as_ref(), Utc::now())
    }

    pub async fn should_trigger(&self, thread_id: &ThreadId) -> bool {
        self.trigger_reason(thread_id).await.is_some()
    }

    /// Start a batch for every queued thread that triggers. Each batch runs
    /// on its own task, so a slow analysis call holds up only its own thread.
    /// Dropping the returned handles detaches the batches; they still finish.
    pub async fn sweep(self: &Arc<Self>) -> Vec<(ThreadId, JoinHandle<BatchOutcome>)> {
        self.queue.purge_expired().await;

        let mut started = Vec::new();
        for thread_id in self.queue.active_threads().await {
            if self.in_flight.contains(&thread_id) {
                debug!(thread_id = %thread_id, "Batch still running, skipping thread this tick");
                continue;
            }
            let Some(reason) = self.trigger_reason(&thread_id).await else {
                continue;
            };

            info!(thread_id = %thread_id, reason = %reason, "Batch triggered");
            let processor = Arc::clone(self);
            let id = thread_id.clone();
            let handle = tokio::spawn(async move { processor.process_thread(&id).await });
            started.push((thread_id, handle));
        }
        started
    }

    /// Sweep and wait for every batch it started.
    pub async fn sweep_and_wait(self: &Arc<Self>) -> Vec<(ThreadId, BatchOutcome)> {
        join_batches(self.sweep().await).await
    }

    /// Final trigger pass for shutdown. Queues that do not meet a threshold are
    /// left in place rather than flushed early.
    pub async fn flush_all(self: &Arc<Self>) -> Vec<(ThreadId, BatchOutcome)> {
        let outcomes = self.sweep_and_wait().await;
        info!(batches = outcomes.len(), "Flushed triggered queues");
        outcomes
    }

    /// Run the batch routine for one thread without checking the trigger.
    pub async fn process_thread(&self, thread_id: &ThreadId) -> BatchOutcome {
        let Some(_claim) = self.in_flight.try_claim(thread_id) else {
            debug!(thread_id = %thread_id, "Batch already in progress");
            return BatchOutcome::InFlight;
        };
        self.run(thread_id).await
    }

    async fn run(&self, thread_id: &ThreadId) -> BatchOutcome {
        let thread = match self.threads.find_thread(thread_id).await {
            Ok(Some(thread)) => thread,
            Ok(None) => {
                error!(thread_id = %thread_id, "Thread not found, clearing its queue");
                self.queue.clear(thread_id).await;
                return BatchOutcome::ThreadMissing;
            }
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Could not load thread, will retry");
                return BatchOutcome::StoreFailed;
            }
        };

        let batch = match self.queue.read_batch(thread_id).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Could not read queue, will retry");
                return BatchOutcome::QueueUnavailable;
            }
        };
        let entries = &batch.entries;
        if entries.is_empty() {
            debug!(thread_id = %thread_id, "Queue already empty");
            return BatchOutcome::Empty;
        }

        info!(thread_id = %thread_id, size = entries.len(), "Processing batch");

        // Positional: result i belongs to entries[i], whatever its comment_index.
        let texts: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
        let context = ThreadContext::from(&thread);
        let reply = match self.analyzer.analyze_batch(&context, &texts).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Batch analysis call failed, keeping queue");
                return BatchOutcome::ServiceFailed;
            }
        };

        let results = match parse_batch(&reply, entries.len()) {
            Ok(results) => results,
            Err(e) => {
                error!(
                    thread_id = %thread_id,
                    error = %e,
                    reply = truncate_to_char_boundary(&reply, LOGGED_REPLY_BYTES),
                    "Unparseable batch reply, dropping batch"
                );
                self.queue.clear_batch(thread_id, &batch).await;
                return BatchOutcome::Malformed;
            }
        };

        match self.apply(thread_id, entries, &results).await {
            Ok(outcome) => {
                self.queue.clear_batch(thread_id, &batch).await;
                if let BatchOutcome::Applied { analyzed, skipped } = &outcome {
                    info!(thread_id = %thread_id, analyzed, skipped, "Batch processed");
                }
                outcome
            }
            Err(ModerationError::ThreadNotFound(_)) => {
                error!(thread_id = %thread_id, "Thread deleted during batch, clearing its queue");
                self.queue.clear(thread_id).await;
                BatchOutcome::ThreadMissing
            }
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Could not save batch results, will retry");
                BatchOutcome::StoreFailed
            }
        }
    }

    /// Write results onto a fresh copy of the thread under its write lock.
    async fn apply(
        &self,
        thread_id: &ThreadId,
        entries: &[QueueEntry],
        results: &[Option<BatchResult>],
    ) -> Result<BatchOutcome, ModerationError> {
        let _guard = self.locks.lock(thread_id).await;

        let mut thread = self
            .threads
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| ModerationError::ThreadNotFound(thread_id.clone()))?;

        let mut analyzed = 0;
        let mut skipped = 0;
        for (entry, result) in entries.iter().zip(results) {
            let Some(result) = result else {
                debug!(thread_id = %thread_id, comment_index = entry.comment_index, "No result for queued comment");
                skipped += 1;
                continue;
            };
            let len = thread.comments.len();
            match thread.comments.get_mut(entry.comment_index) {
                Some(comment) => {
                    comment.analysis = result.to_analysis();
                    analyzed += 1;
                }
                None => {
                    let mismatch = ModerationError::CommentIndexMismatch {
                        thread_id: thread_id.clone(),
                        index: entry.comment_index,
                        len,
                    };
                    warn!(error = %mismatch, "Skipping batch result");
                    skipped += 1;
                }
            }
        }

        if analyzed > 0 {
            self.threads.save_thread(&thread).await?;
        }
        Ok(BatchOutcome::Applied { analyzed, skipped })
    }
}

/// Wait for started batches. A panicked batch is logged and left out.
pub async fn join_batches(
    started: Vec<(ThreadId, JoinHandle<BatchOutcome>)>,
) -> Vec<(ThreadId, BatchOutcome)> {
    let (ids, handles): (Vec<_>, Vec<_>) = started.into_iter().unzip();

    let mut outcomes = Vec::with_capacity(ids.len());
    for (thread_id, joined) in ids.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(outcome) => outcomes.push((thread_id, outcome)),
            Err(e) => error!(thread_id = %thread_id, error = %e, "Batch task panicked"),
        }
    }
    outcomes
}
