use thiserror::Error;

use crate::types::ThreadId;

#[derive(Error, Debug)]
pub enum ModerationError {
    /// The durable queue backend could not be reached.
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Analysis service error: {0}")]
    ExternalService(String),

    #[error("Malformed analysis response: {0}")]
    MalformedResponse(String),

    #[error("Thread {0} not found")]
    ThreadNotFound(ThreadId),

    #[error("Profile for user {0} not found")]
    ProfileNotFound(String),

    #[error("Comment index {index} out of range for thread {thread_id} ({len} comments)")]
    CommentIndexMismatch {
        thread_id: ThreadId,
        index: usize,
        len: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
