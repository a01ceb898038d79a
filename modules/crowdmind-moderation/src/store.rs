// Collaborator contracts for the forum's persistent stores.
//
// The moderation core only reads threads/profiles and writes back
// `comments[i].analysis`, the summary fields, and `ProfileScores`.

use anyhow::Result;
use async_trait::async_trait;

use crowdmind_common::{Profile, Thread, ThreadId};

#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn find_thread(&self, id: &ThreadId) -> Result<Option<Thread>>;

    async fn save_thread(&self, thread: &Thread) -> Result<()>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn save_profile(&self, profile: &Profile) -> Result<()>;
}
