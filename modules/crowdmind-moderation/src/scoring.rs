use std::sync::Arc;

use tracing::{debug, info};

use crowdmind_common::{ModerationError, ProfileScores};

use crate::locks::KeyedLocks;
use crate::store::ProfileStore;

/// Incremental mean: folds `new_value` into an average of `prior_count`
/// values, rounded to two decimals. The first value is returned as is.
pub fn update_running_average(previous_average: f64, new_value: f64, prior_count: u64) -> f64 {
    if prior_count == 0 {
        return new_value;
    }
    let n = prior_count as f64;
    round2((previous_average * n + new_value) / (n + 1.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Scores outside 0-100 are clamped; NaN counts as 0.
fn sanitize(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// Fold one accepted item's moderation scores into the author's aggregates.
/// Inputs are sanitized first so the averages stay finite and in range.
pub fn apply_scores(scores: &mut ProfileScores, toxicity: f64, bias: f64) {
    let prior = scores.total_posts;
    scores.avg_toxicity = update_running_average(scores.avg_toxicity, sanitize(toxicity), prior);
    scores.avg_bias = update_running_average(scores.avg_bias, sanitize(bias), prior);
    scores.total_posts = prior + 1;

    scores.toxicity_score = scores.avg_toxicity;
    scores.bias_score = scores.avg_bias;
}

/// Inputs to the leaderboard ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Activity {
    pub posts: u64,
    pub comments: u64,
    pub likes: u64,
    pub avg_toxicity: f64,
    pub avg_bias: f64,
}

const POST_WEIGHT: f64 = 10.0;
const COMMENT_WEIGHT: f64 = 5.0;
const LIKE_WEIGHT: f64 = 1.0;
const TOXICITY_PENALTY: f64 = 0.1;
const BIAS_PENALTY: f64 = 0.1;

pub fn engagement_score(activity: &Activity) -> f64 {
    let base = activity.posts as f64 * POST_WEIGHT
        + activity.comments as f64 * COMMENT_WEIGHT
        + activity.likes as f64 * LIKE_WEIGHT;
    let penalty = activity.avg_toxicity * TOXICITY_PENALTY + activity.avg_bias * BIAS_PENALTY;
    (base - penalty).max(0.0)
}

/// Updates author aggregates synchronously at acceptance time.
#[derive(Clone)]
pub struct ScoringEngine {
    profiles: Arc<dyn ProfileStore>,
    locks: Arc<KeyedLocks<String>>,
}

impl ScoringEngine {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Record one accepted post or comment. Exactly one increment of
    /// `total_posts` per call, also when calls for one author overlap.
    pub async fn record(
        &self,
        user_id: &str,
        toxicity: f64,
        bias: f64,
    ) -> Result<ProfileScores, ModerationError> {
        let _guard = self.locks.lock(&user_id.to_string()).await;
        let mut profile = self
            .profiles
            .find_profile(user_id)
            .await?
            .ok_or_else(|| ModerationError::ProfileNotFound(user_id.to_string()))?;

        apply_scores(&mut profile.scores, toxicity, bias);
        self.profiles.save_profile(&profile).await?;

        debug!(
            user_id,
            total_posts = profile.scores.total_posts,
            avg_toxicity = profile.scores.avg_toxicity,
            avg_bias = profile.scores.avg_bias,
            "Updated profile scores"
        );
        if profile.scores.total_posts == 1 {
            info!(user_id, "First scored item for profile");
        }

        Ok(profile.scores)
    }
}
