// The external text-analysis service as the pipeline sees it.
//
// Each method is exactly one call to the service and returns its raw reply.
// Call failures are errors here; interpreting the reply (and deciding that it
// is malformed) is the caller's job via `response`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use ai_client::{ChatModel, OpenAi};
use crowdmind_common::{Config, Thread};

use crate::prompts;

/// What the analysis prompts need to know about a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadContext {
    pub title: String,
    pub summary: Option<String>,
}

impl From<&Thread> for ThreadContext {
    fn from(thread: &Thread) -> Self {
        Self {
            title: thread.title.clone(),
            summary: thread.summary.clone(),
        }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Analyze several comments in one call. The reply is positionally
    /// parallel to `comments`.
    async fn analyze_batch(&self, thread: &ThreadContext, comments: &[String]) -> Result<String>;

    async fn check_relevance(&self, thread: &ThreadContext, comment: &str) -> Result<String>;

    async fn fact_check(&self, thread: &ThreadContext, comment: &str) -> Result<String>;

    async fn summarize(&self, thread: &Thread) -> Result<String>;
}

/// Prompt-driven analysis over any chat model; Gemini by default.
#[derive(Clone)]
pub struct GeminiAnalyzer {
    model: Arc<dyn ChatModel>,
}

impl GeminiAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub fn from_config(config: &Config) -> Self {
        let ai = OpenAi::new(&config.analysis_api_key, &config.analysis_model)
            .with_base_url(&config.analysis_base_url);
        Self::new(Arc::new(ai))
    }
}

#[async_trait]
impl AnalysisService for GeminiAnalyzer {
    async fn analyze_batch(&self, thread: &ThreadContext, comments: &[String]) -> Result<String> {
        let prompt = prompts::batch_prompt(thread.summary.as_deref(), comments);
        self.model.prompt(prompt).await
    }

    async fn check_relevance(&self, thread: &ThreadContext, comment: &str) -> Result<String> {
        let prompt = prompts::relevance_prompt(&thread.title, thread.summary.as_deref(), comment);
        self.model.prompt(prompt).await
    }

    async fn fact_check(&self, thread: &ThreadContext, comment: &str) -> Result<String> {
        let prompt = prompts::fact_check_prompt(comment, thread.summary.as_deref());
        self.model.prompt(prompt).await
    }

    async fn summarize(&self, thread: &Thread) -> Result<String> {
        self.model.prompt(prompts::summary_prompt(thread)).await
    }
}
