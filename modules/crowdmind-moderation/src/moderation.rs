// Lifecycle orchestrator for the moderation pipeline.
//
// Owns the selected queue store and wires it to the batch processor, the
// immediate pipeline, scoring and summaries. The periodic sweep is a single
// background task started and stopped from here.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crowdmind_common::{
    CommentAnalysis, Config, EnqueueOutcome, ModerationError, ProfileScores, QueueEntry, Thread,
    ThreadId,
};

use crate::analyzer::{AnalysisService, GeminiAnalyzer};
use crate::batch::{join_batches, BatchOutcome, BatchProcessor};
use crate::display;
use crate::immediate::ImmediatePipeline;
use crate::locks::ThreadLocks;
use crate::queue::QueueStore;
use crate::scoring::ScoringEngine;
use crate::store::{ProfileStore, ThreadStore};
use crate::summary::{DiscussionSummary, SummaryService};
use crate::trigger::TriggerPolicy;

/// A comment the forum has just persisted, with its moderation scores.
#[derive(Debug, Clone)]
pub struct AcceptedComment {
    pub thread_id: ThreadId,
    pub comment_index: usize,
    pub text: String,
    pub author_id: String,
    pub toxicity: f64,
    pub bias: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptOutcome {
    pub enqueue: EnqueueOutcome,
    pub scores: ProfileScores,
}

type Started = Vec<(ThreadId, JoinHandle<BatchOutcome>)>;

struct SweepTask {
    stop: oneshot::Sender<()>,
    /// Resolves to the batches still running when the loop stopped.
    handle: JoinHandle<Started>,
}

pub struct Moderation {
    config: Config,
    queue: QueueStore,
    threads: Arc<dyn ThreadStore>,
    batch: Arc<BatchProcessor>,
    immediate: Arc<ImmediatePipeline>,
    scoring: ScoringEngine,
    summaries: SummaryService,
    sweep: Mutex<Option<SweepTask>>,
}

impl Moderation {
    /// Select the queue backend and build the Gemini analyzer from `config`.
    pub async fn connect(
        config: Config,
        threads: Arc<dyn ThreadStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        config.log_redacted();
        let queue = QueueStore::connect(&config).await;
        let analyzer = Arc::new(GeminiAnalyzer::from_config(&config));
        Self::new(config, queue, threads, profiles, analyzer)
    }

    pub fn new(
        config: Config,
        queue: QueueStore,
        threads: Arc<dyn ThreadStore>,
        profiles: Arc<dyn ProfileStore>,
        analyzer: Arc<dyn AnalysisService>,
    ) -> Self {
        let locks = Arc::new(ThreadLocks::new());
        let batch = Arc::new(BatchProcessor::new(
            queue.clone(),
            threads.clone(),
            analyzer.clone(),
            TriggerPolicy::from_config(&config),
            locks.clone(),
        ));
        let immediate = Arc::new(ImmediatePipeline::new(
            threads.clone(),
            analyzer.clone(),
            locks.clone(),
            config.analysis_delay,
        ));
        let summaries = SummaryService::new(threads.clone(), analyzer, locks, config.summary_max_age);

        Self {
            queue,
            threads,
            batch,
            immediate,
            scoring: ScoringEngine::new(profiles),
            summaries,
            sweep: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn batch(&self) -> &Arc<BatchProcessor> {
        &self.batch
    }

    // -----------------------------------------------------------------------
    // Acceptance
    // -----------------------------------------------------------------------

    /// Queue a stored comment for batch analysis. Never fails: if the
    /// durable backend is down the entry lands in the local fallback.
    ///
    /// Queued indices must increase. A comment whose index is not past the
    /// newest queued one is logged and left out (`queued: false`).
    pub async fn enqueue(
        &self,
        thread_id: &ThreadId,
        comment_index: usize,
        text: impl Into<String>,
    ) -> EnqueueOutcome {
        if let Some(newest) = self.queue.newest_index(thread_id).await {
            if comment_index <= newest {
                warn!(
                    thread_id = %thread_id,
                    comment_index,
                    newest_queued = newest,
                    "Comment index is not past the queue tail, not queueing"
                );
                return EnqueueOutcome {
                    queued: false,
                    queue_size: self.queue.length(thread_id).await,
                };
            }
        }

        self.queue
            .append(thread_id, QueueEntry::new(comment_index, text))
            .await;
        self.queue
            .set_retention(thread_id, self.config.queue_retention)
            .await;
        let queue_size = self.queue.length(thread_id).await;

        debug!(thread_id = %thread_id, comment_index, queue_size, "Comment queued");
        EnqueueOutcome {
            queued: true,
            queue_size,
        }
    }

    /// Start immediate analysis of one comment, if enabled.
    pub fn submit_immediate(&self, thread_id: &ThreadId, comment_index: usize) -> Option<JoinHandle<()>> {
        if !self.config.immediate_analysis {
            return None;
        }
        Some(self.immediate.schedule(thread_id.clone(), comment_index))
    }

    pub async fn record_scores(
        &self,
        user_id: &str,
        toxicity: f64,
        bias: f64,
    ) -> Result<ProfileScores, ModerationError> {
        self.scoring.record(user_id, toxicity, bias).await
    }

    /// Everything that happens once the forum has stored a comment: queue it,
    /// kick off immediate analysis, and fold its scores into the author's
    /// profile. A scoring error is returned only after the comment is queued.
    pub async fn accept_comment(&self, comment: AcceptedComment) -> Result<AcceptOutcome, ModerationError> {
        let enqueue = self
            .enqueue(&comment.thread_id, comment.comment_index, comment.text)
            .await;
        // Detached; the pipeline logs its own failures.
        let _ = self.submit_immediate(&comment.thread_id, comment.comment_index);

        let scores = self
            .record_scores(&comment.author_id, comment.toxicity, comment.bias)
            .await?;
        Ok(AcceptOutcome { enqueue, scores })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current analysis state of one comment, for polling clients.
    pub async fn get_analysis(
        &self,
        thread_id: &ThreadId,
        comment_index: usize,
    ) -> Result<CommentAnalysis, ModerationError> {
        let thread = self.load(thread_id).await?;
        display::analysis_at(&thread, comment_index)
            .cloned()
            .ok_or_else(|| ModerationError::CommentIndexMismatch {
                thread_id: thread_id.clone(),
                index: comment_index,
                len: thread.comments.len(),
            })
    }

    /// Comment positions in relevance display order.
    pub async fn display_order(&self, thread_id: &ThreadId) -> Result<Vec<usize>, ModerationError> {
        let thread = self.load(thread_id).await?;
        Ok(display::relevance_order(&thread.comments))
    }

    pub async fn ensure_summary(&self, thread_id: &ThreadId) -> Result<DiscussionSummary, ModerationError> {
        self.summaries.ensure_summary(thread_id).await
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Thread, ModerationError> {
        self.threads
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| ModerationError::ThreadNotFound(thread_id.clone()))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the periodic sweep. Returns false if it was already running.
    pub fn start_sweep(&self) -> bool {
        let mut slot = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            debug!("Batch sweep already running");
            return false;
        }

        let (stop, mut stopped) = oneshot::channel::<()>();
        let batch = Arc::clone(&self.batch);
        let period = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut running: Started = Vec::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        running.retain(|(_, handle)| !handle.is_finished());
                        let started = batch.sweep().await;
                        if !started.is_empty() {
                            debug!(batches = started.len(), "Sweep started batches");
                        }
                        running.extend(started);
                    }
                    _ = &mut stopped => break,
                }
            }
            running
        });

        *slot = Some(SweepTask { stop, handle });
        info!(interval_secs = period.as_secs(), "Batch sweep started");
        true
    }

    /// Stop the periodic sweep and wait for the batches it started that are
    /// still running. Returns their outcomes.
    pub async fn stop_sweep(&self) -> Vec<(ThreadId, BatchOutcome)> {
        let task = self.sweep.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return Vec::new();
        };
        let _ = task.stop.send(());
        let running = match task.handle.await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "Sweep task ended abnormally");
                Vec::new()
            }
        };
        if !running.is_empty() {
            info!(batches = running.len(), "Waiting for running batches");
        }
        let outcomes = join_batches(running).await;
        info!("Batch sweep stopped");
        outcomes
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One final trigger pass. Queues below both thresholds stay queued.
    pub async fn flush_all(&self) -> Vec<(ThreadId, BatchOutcome)> {
        self.batch.flush_all().await
    }

    /// Stop the sweep, wait for its running batches, then flush. Returns the
    /// outcomes of both.
    pub async fn shutdown(&self) -> Vec<(ThreadId, BatchOutcome)> {
        info!("Shutting down moderation");
        let mut outcomes = self.stop_sweep().await;
        outcomes.extend(self.flush_all().await);
        outcomes
    }
}
