use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Identifiers ---

/// Opaque thread identifier, owned by the thread store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ThreadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// --- Queue ---

/// One comment waiting for batch analysis. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Position of the comment in the thread's comment sequence at enqueue time.
    pub comment_index: usize,
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(comment_index: usize, text: impl Into<String>) -> Self {
        Self {
            comment_index,
            text: text.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn at(comment_index: usize, text: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            comment_index,
            text: text.into(),
            enqueued_at,
        }
    }
}

/// Result of handing a comment to the queue. `queued` is false when the
/// comment's index was not past the newest queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub queued: bool,
    pub queue_size: usize,
}

// --- Analysis ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AnalysisStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactualAccuracy {
    Verified,
    Disputed,
    Unverifiable,
}

impl FactualAccuracy {
    /// Case-insensitive match; anything unrecognised is `Unverifiable`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("verified") => FactualAccuracy::Verified,
            Some("disputed") => FactualAccuracy::Disputed,
            _ => FactualAccuracy::Unverifiable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FactualAccuracy::Verified => "verified",
            FactualAccuracy::Disputed => "disputed",
            FactualAccuracy::Unverifiable => "unverifiable",
        }
    }
}

/// Analysis attached to a single comment. Created pending, overwritten by
/// either analysis path, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentAnalysis {
    /// 1-100, absent until relevance has been scored.
    pub relevance_score: Option<u8>,
    pub relevance_status: AnalysisStatus,
    pub fact_check_status: AnalysisStatus,
    pub has_factual_claims: bool,
    pub factual_accuracy: Option<FactualAccuracy>,
    pub notes: String,
}

impl CommentAnalysis {
    pub fn is_complete(&self) -> bool {
        self.relevance_status.is_terminal() && self.fact_check_status.is_terminal()
    }

    /// Record a terminal failure on both sub-checks, keeping any score already set.
    pub fn mark_failed(&mut self, notes: impl Into<String>) {
        self.relevance_status = AnalysisStatus::Failed;
        self.fact_check_status = AnalysisStatus::Failed;
        self.notes = notes.into();
    }
}

// --- Threads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: Option<String>,
    pub username: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub analysis: CommentAnalysis,
}

impl Comment {
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: None,
            username: username.into(),
            text: text.into(),
            created_at: Utc::now(),
            analysis: CommentAnalysis::default(),
        }
    }
}

/// The subset of a forum thread the moderation core reads and writes.
/// Only `comments[i].analysis` and the summary fields are ever mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub context: Option<String>,
    pub last_summary_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Thread {
    pub fn new(id: impl Into<ThreadId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            summary: None,
            context: None,
            last_summary_update: None,
            comments: Vec::new(),
        }
    }

    /// Append a comment and return its stable index.
    pub fn push_comment(&mut self, comment: Comment) -> usize {
        self.comments.push(comment);
        self.comments.len() - 1
    }
}

// --- Profiles ---

/// Per-author aggregate moderation metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileScores {
    pub total_posts: u64,
    pub avg_toxicity: f64,
    pub avg_bias: f64,
    /// Leaderboard mirror of `avg_toxicity`.
    pub toxicity_score: f64,
    /// Leaderboard mirror of `avg_bias`.
    pub bias_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub scores: ProfileScores,
}

impl Profile {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            scores: ProfileScores::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factual_accuracy_normalizes_case_and_unknowns() {
        assert_eq!(
            FactualAccuracy::normalize(Some("Verified")),
            FactualAccuracy::Verified
        );
        assert_eq!(
            FactualAccuracy::normalize(Some(" DISPUTED ")),
            FactualAccuracy::Disputed
        );
        assert_eq!(
            FactualAccuracy::normalize(Some("probably true")),
            FactualAccuracy::Unverifiable
        );
        assert_eq!(FactualAccuracy::normalize(None), FactualAccuracy::Unverifiable);
    }

    #[test]
    fn new_analysis_is_pending() {
        let analysis = CommentAnalysis::default();
        assert_eq!(analysis.relevance_status, AnalysisStatus::Pending);
        assert_eq!(analysis.fact_check_status, AnalysisStatus::Pending);
        assert!(!analysis.is_complete());
        assert!(analysis.relevance_score.is_none());
    }

    #[test]
    fn mark_failed_is_terminal_on_both_fields() {
        let mut analysis = CommentAnalysis::default();
        analysis.mark_failed("Analysis failed");
        assert!(analysis.is_complete());
        assert_eq!(analysis.relevance_status, AnalysisStatus::Failed);
        assert_eq!(analysis.fact_check_status, AnalysisStatus::Failed);
        assert_eq!(analysis.notes, "Analysis failed");
    }

    #[test]
    fn analysis_status_serializes_lowercase() {
        let json = serde_json::to_string(&AnalysisStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn push_comment_returns_stable_index() {
        let mut thread = Thread::new("t1", "Title");
        assert_eq!(thread.push_comment(Comment::new("a", "first")), 0);
        assert_eq!(thread.push_comment(Comment::new("b", "second")), 1);
    }
}
