pub mod analyzer;
pub mod batch;
pub mod display;
pub mod immediate;
pub mod locks;
pub mod moderation;
pub mod prompts;
pub mod queue;
pub mod response;
pub mod scoring;
pub mod store;
pub mod summary;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod trigger;

pub use analyzer::{AnalysisService, GeminiAnalyzer};
pub use batch::{BatchOutcome, BatchProcessor};
pub use immediate::ImmediatePipeline;
pub use moderation::{AcceptOutcome, AcceptedComment, Moderation};
pub use queue::{MarkedEntries, MemoryQueue, PgQueue, QueueBackend, QueueBatch, QueueStore};
pub use scoring::{update_running_average, ScoringEngine};
pub use store::{ProfileStore, ThreadStore};
pub use summary::{DiscussionSummary, SummaryService};
pub use trigger::{TriggerPolicy, TriggerReason};
