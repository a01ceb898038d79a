use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crowdmind_common::{AnalysisStatus, CommentAnalysis, ModerationError, Thread, ThreadId};

use crate::analyzer::{AnalysisService, ThreadContext};
use crate::locks::ThreadLocks;
use crate::response::{parse_fact_check, parse_relevance, FactCheckVerdict, RelevanceVerdict};
use crate::store::ThreadStore;

const RELEVANCE_UNAVAILABLE: &str = "Relevance check unavailable";
const FACT_CHECK_UNAVAILABLE: &str = "Fact-check unavailable";
const ANALYSIS_FAILED: &str = "Analysis failed";

/// Analyzes a single comment right after it is accepted, with the relevance
/// and fact checks running concurrently.
pub struct ImmediatePipeline {
    threads: Arc<dyn ThreadStore>,
    analyzer: Arc<dyn AnalysisService>,
    locks: Arc<ThreadLocks>,
    delay: Duration,
}

impl ImmediatePipeline {
    pub fn new(
        threads: Arc<dyn ThreadStore>,
        analyzer: Arc<dyn AnalysisService>,
        locks: Arc<ThreadLocks>,
        delay: Duration,
    ) -> Self {
        Self {
            threads,
            analyzer,
            locks,
            delay,
        }
    }

    /// Fire-and-forget: after the configured delay, analyze the comment on a
    /// background task. The submitter is never blocked or failed.
    pub fn schedule(self: &Arc<Self>, thread_id: ThreadId, comment_index: usize) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if !pipeline.delay.is_zero() {
                tokio::time::sleep(pipeline.delay).await;
            }
            if let Err(e) = pipeline.analyze(&thread_id, comment_index).await {
                warn!(thread_id = %thread_id, comment_index, error = %e, "Immediate analysis failed");
                pipeline.record_failure(&thread_id, comment_index).await;
            }
        })
    }

    /// Run both checks for one stored comment and write the merged result.
    pub async fn analyze(
        &self,
        thread_id: &ThreadId,
        comment_index: usize,
    ) -> Result<CommentAnalysis, ModerationError> {
        let thread = self.load(thread_id).await?;
        let text = thread
            .comments
            .get(comment_index)
            .map(|c| c.text.clone())
            .ok_or_else(|| ModerationError::CommentIndexMismatch {
                thread_id: thread_id.clone(),
                index: comment_index,
                len: thread.comments.len(),
            })?;
        let context = ThreadContext::from(&thread);

        info!(thread_id = %thread_id, comment_index, "Starting immediate analysis");
        let (relevance, fact_check) =
            tokio::join!(self.relevance(&context, &text), self.fact_check(&context, &text));
        let analysis = merge(relevance, fact_check);

        self.write(thread_id, comment_index, |current| *current = analysis.clone())
            .await?;
        debug!(
            thread_id = %thread_id,
            comment_index,
            relevance = ?analysis.relevance_score,
            "Immediate analysis saved"
        );
        Ok(analysis)
    }

    async fn relevance(
        &self,
        context: &ThreadContext,
        text: &str,
    ) -> Result<RelevanceVerdict, ModerationError> {
        let raw = self
            .analyzer
            .check_relevance(context, text)
            .await
            .map_err(|e| ModerationError::ExternalService(e.to_string()))?;
        parse_relevance(&raw)
    }

    async fn fact_check(
        &self,
        context: &ThreadContext,
        text: &str,
    ) -> Result<FactCheckVerdict, ModerationError> {
        let raw = self
            .analyzer
            .fact_check(context, text)
            .await
            .map_err(|e| ModerationError::ExternalService(e.to_string()))?;
        parse_fact_check(&raw)
    }

    /// Mark both checks failed, unless the comment already reached a terminal
    /// state by another path.
    async fn record_failure(&self, thread_id: &ThreadId, comment_index: usize) {
        let result = self
            .write(thread_id, comment_index, |current| {
                if !current.is_complete() {
                    current.mark_failed(ANALYSIS_FAILED);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(thread_id = %thread_id, comment_index, error = %e, "Could not record analysis failure");
        }
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Thread, ModerationError> {
        self.threads
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| ModerationError::ThreadNotFound(thread_id.clone()))
    }

    /// Reload, modify one comment's analysis, save; all under the thread lock.
    async fn write(
        &self,
        thread_id: &ThreadId,
        comment_index: usize,
        f: impl FnOnce(&mut CommentAnalysis),
    ) -> Result<(), ModerationError> {
        let _guard = self.locks.lock(thread_id).await;
        let mut thread = self.load(thread_id).await?;
        let len = thread.comments.len();
        let comment = thread
            .comments
            .get_mut(comment_index)
            .ok_or_else(|| ModerationError::CommentIndexMismatch {
                thread_id: thread_id.clone(),
                index: comment_index,
                len,
            })?;
        f(&mut comment.analysis);
        self.threads.save_thread(&thread).await?;
        Ok(())
    }
}

/// Combine the two sub-checks. A failed one is marked failed on its own;
/// the other keeps its result.
fn merge(
    relevance: Result<RelevanceVerdict, ModerationError>,
    fact_check: Result<FactCheckVerdict, ModerationError>,
) -> CommentAnalysis {
    let mut analysis = CommentAnalysis::default();

    let reason = match relevance {
        Ok(verdict) => {
            analysis.relevance_score = Some(verdict.score);
            analysis.relevance_status = AnalysisStatus::Completed;
            verdict.reason
        }
        Err(e) => {
            warn!(error = %e, "Relevance check failed");
            analysis.relevance_status = AnalysisStatus::Failed;
            RELEVANCE_UNAVAILABLE.to_string()
        }
    };

    let findings = match fact_check {
        Ok(verdict) => {
            analysis.fact_check_status = AnalysisStatus::Completed;
            analysis.has_factual_claims = verdict.has_factual_claims;
            analysis.factual_accuracy = Some(verdict.accuracy);
            if verdict.flags.is_empty() {
                verdict.findings
            } else {
                format!("{} Flagged: {}", verdict.findings, verdict.flags.join("; "))
            }
        }
        Err(e) => {
            warn!(error = %e, "Fact-check failed");
            analysis.fact_check_status = AnalysisStatus::Failed;
            FACT_CHECK_UNAVAILABLE.to_string()
        }
    };

    analysis.notes = format!("Relevance: {reason}. Fact-check: {findings}");
    analysis
}
