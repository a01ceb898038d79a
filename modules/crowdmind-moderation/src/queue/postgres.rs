use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crowdmind_common::{QueueEntry, ThreadId};

use super::{MarkedEntries, QueueBackend};

// Rows past their expiry are invisible to reads and removed by `purge_expired`.
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    comment_index: i64,
    text: String,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = anyhow::Error;

    fn try_from(row: QueueRow) -> Result<Self> {
        let comment_index = usize::try_from(row.comment_index)
            .with_context(|| format!("negative comment_index {}", row.comment_index))?;
        Ok(QueueEntry::at(comment_index, row.text, row.enqueued_at))
    }
}

/// Durable per-thread queue in the `comment_queue` table. FIFO order is the
/// insertion sequence.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for PgQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn append(&self, thread_id: &ThreadId, entry: &QueueEntry) -> Result<()> {
        let comment_index = i64::try_from(entry.comment_index)?;
        sqlx::query(
            r#"
            INSERT INTO comment_queue (thread_id, comment_index, text, enqueued_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(thread_id.as_str())
        .bind(comment_index)
        .bind(&entry.text)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn length(&self, thread_id: &ThreadId) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM comment_queue WHERE thread_id = $1 AND {LIVE}"
        ))
        .bind(thread_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count)?)
    }

    async fn read_marked(&self, thread_id: &ThreadId) -> Result<MarkedEntries> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT id, comment_index, text, enqueued_at
            FROM comment_queue
            WHERE thread_id = $1 AND {LIVE}
            ORDER BY id ASC
            "#
        ))
        .bind(thread_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mark = rows
            .last()
            .map(|row| u64::try_from(row.id))
            .transpose()?;
        let entries = rows
            .into_iter()
            .map(QueueEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(MarkedEntries { entries, mark })
    }

    async fn peek_oldest(&self, thread_id: &ThreadId) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT id, comment_index, text, enqueued_at
            FROM comment_queue
            WHERE thread_id = $1 AND {LIVE}
            ORDER BY id ASC
            LIMIT 1
            "#
        ))
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn newest_index(&self, thread_id: &ThreadId) -> Result<Option<usize>> {
        let index = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            SELECT comment_index
            FROM comment_queue
            WHERE thread_id = $1 AND {LIVE}
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        index.map(usize::try_from).transpose().map_err(Into::into)
    }

    async fn clear_through(&self, thread_id: &ThreadId, mark: u64) -> Result<()> {
        sqlx::query("DELETE FROM comment_queue WHERE thread_id = $1 AND id <= $2")
            .bind(thread_id.as_str())
            .bind(i64::try_from(mark)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        sqlx::query("DELETE FROM comment_queue WHERE thread_id = $1")
            .bind(thread_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_threads(&self) -> Result<Vec<ThreadId>> {
        let ids = sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT thread_id FROM comment_queue WHERE {LIVE} ORDER BY thread_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ThreadId::from).collect())
    }

    async fn set_retention(&self, thread_id: &ThreadId, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        sqlx::query("UPDATE comment_queue SET expires_at = $2 WHERE thread_id = $1")
            .bind(thread_id.as_str())
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM comment_queue WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
