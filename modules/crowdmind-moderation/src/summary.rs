use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crowdmind_common::{ModerationError, Thread, ThreadId};

use crate::analyzer::AnalysisService;
use crate::locks::ThreadLocks;
use crate::response::parse_summary;
use crate::store::ThreadStore;

/// The thread summary that analysis prompts are given as context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionSummary {
    pub summary: String,
    pub context: Option<String>,
    pub last_update: DateTime<Utc>,
}

pub struct SummaryService {
    threads: Arc<dyn ThreadStore>,
    analyzer: Arc<dyn AnalysisService>,
    locks: Arc<ThreadLocks>,
    max_age: Duration,
}

impl SummaryService {
    pub fn new(
        threads: Arc<dyn ThreadStore>,
        analyzer: Arc<dyn AnalysisService>,
        locks: Arc<ThreadLocks>,
        max_age: Duration,
    ) -> Self {
        Self {
            threads,
            analyzer,
            locks,
            max_age,
        }
    }

    /// Return the thread's summary, regenerating it when missing or older
    /// than the freshness window.
    pub async fn ensure_summary(&self, thread_id: &ThreadId) -> Result<DiscussionSummary, ModerationError> {
        let thread = self.load(thread_id).await?;
        let now = Utc::now();

        if let Some(cached) = self.fresh(&thread, now) {
            debug!(thread_id = %thread_id, "Using cached discussion summary");
            return Ok(cached);
        }

        info!(thread_id = %thread_id, comments = thread.comments.len(), "Regenerating discussion summary");
        let raw = self
            .analyzer
            .summarize(&thread)
            .await
            .map_err(|e| ModerationError::ExternalService(e.to_string()))?;
        let reply = parse_summary(&raw)?;
        let context = (!reply.context.is_empty()).then_some(reply.context);

        let _guard = self.locks.lock(thread_id).await;
        let mut fresh = self.load(thread_id).await?;
        fresh.summary = Some(reply.summary.clone());
        fresh.context = context.clone();
        fresh.last_summary_update = Some(now);
        self.threads.save_thread(&fresh).await?;

        Ok(DiscussionSummary {
            summary: reply.summary,
            context,
            last_update: now,
        })
    }

    /// A summary with no recorded update time counts as stale.
    fn fresh(&self, thread: &Thread, now: DateTime<Utc>) -> Option<DiscussionSummary> {
        let summary = thread.summary.as_ref()?;
        let last_update = thread.last_summary_update?;
        let age = (now - last_update).to_std().unwrap_or(Duration::ZERO);
        (age < self.max_age).then(|| DiscussionSummary {
            summary: summary.clone(),
            context: thread.context.clone(),
            last_update,
        })
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Thread, ModerationError> {
        self.threads
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| ModerationError::ThreadNotFound(thread_id.clone()))
    }
}
