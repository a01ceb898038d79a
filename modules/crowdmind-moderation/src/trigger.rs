use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crowdmind_common::{Config, QueueEntry};

/// Why a thread's queue is ready to be analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The queue reached the size threshold.
    Size,
    /// The oldest entry waited longer than the age threshold.
    Age,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Size => f.write_str("size"),
            TriggerReason::Age => f.write_str("age"),
        }
    }
}

/// Size/age thresholds deciding when a queue is flushed. Either one alone
/// is enough: size bounds the batch cost, age bounds the latency.
#[derive(Debug, Clone, Copy)]
pub struct TriggerPolicy {
    pub size_threshold: usize,
    pub age_threshold: Duration,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            size_threshold: 5,
            age_threshold: Duration::from_secs(60),
        }
    }
}

impl TriggerPolicy {
    pub fn new(size_threshold: usize, age_threshold: Duration) -> Self {
        Self {
            size_threshold,
            age_threshold,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.batch_size, config.batch_timeout)
    }

    pub fn evaluate(
        &self,
        length: usize,
        oldest: Option<&QueueEntry>,
        now: DateTime<Utc>,
    ) -> Option<TriggerReason> {
        if length == 0 {
            return None;
        }
        if length >= self.size_threshold {
            return Some(TriggerReason::Size);
        }

        let oldest = oldest?;
        // A clock step backwards gives a negative age, which never triggers.
        let age = (now - oldest.enqueued_at).to_std().ok()?;
        (age > self.age_threshold).then_some(TriggerReason::Age)
    }

    pub fn should_trigger(
        &self,
        length: usize,
        oldest: Option<&QueueEntry>,
        now: DateTime<Utc>,
    ) -> bool {
        self.evaluate(length, oldest, now).is_some()
    }
}
