use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::ModerationError;

pub const GEMINI_OPENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const DEFAULT_ANALYSIS_MODEL: &str = "gemini-2.0-flash";

/// Moderation pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL for the durable queue. `None` selects the in-process queue.
    pub database_url: Option<String>,

    // Analysis service
    pub analysis_api_key: String,
    pub analysis_base_url: String,
    pub analysis_model: String,

    // Batching
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub sweep_interval: Duration,
    pub queue_retention: Duration,

    // Immediate analysis
    pub immediate_analysis: bool,
    pub analysis_delay: Duration,

    pub summary_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            analysis_api_key: String::new(),
            analysis_base_url: GEMINI_OPENAI_BASE_URL.to_string(),
            analysis_model: DEFAULT_ANALYSIS_MODEL.to_string(),
            batch_size: 5,
            batch_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            queue_retention: Duration::from_secs(48 * 60 * 60),
            immediate_analysis: true,
            analysis_delay: Duration::from_millis(500),
            summary_max_age: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ModerationError> {
        let defaults = Self::default();

        let batch_size = parsed_env("BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ModerationError::Config(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            analysis_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            analysis_base_url: env::var("ANALYSIS_BASE_URL")
                .unwrap_or(defaults.analysis_base_url),
            analysis_model: env::var("ANALYSIS_MODEL").unwrap_or(defaults.analysis_model),
            batch_size,
            batch_timeout: Duration::from_secs(parsed_env("BATCH_TIMEOUT_SECS", 60)?),
            sweep_interval: Duration::from_secs(parsed_env("SWEEP_INTERVAL_SECS", 10)?),
            queue_retention: scaled_env("QUEUE_RETENTION_HOURS", 48, 60 * 60)?,
            immediate_analysis: parsed_env("IMMEDIATE_ANALYSIS", defaults.immediate_analysis)?,
            analysis_delay: Duration::from_millis(parsed_env("ANALYSIS_DELAY_MS", 500)?),
            summary_max_age: scaled_env("SUMMARY_MAX_AGE_MINS", 60, 60)?,
        })
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            queue_backend = if self.database_url.is_some() { "postgres" } else { "memory" },
            analysis_key = if self.analysis_api_key.is_empty() { "missing" } else { "set" },
            analysis_base_url = %self.analysis_base_url,
            analysis_model = %self.analysis_model,
            batch_size = self.batch_size,
            batch_timeout_secs = self.batch_timeout.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            queue_retention_hours = self.queue_retention.as_secs() / 3600,
            immediate_analysis = self.immediate_analysis,
            analysis_delay_ms = self.analysis_delay.as_millis() as u64,
            "Moderation config"
        );
    }
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> Result<T, ModerationError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ModerationError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

/// A duration given in units of `unit_secs` seconds.
fn scaled_env(key: &str, default: u64, unit_secs: u64) -> Result<Duration, ModerationError> {
    let value = parsed_env(key, default)?;
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| ModerationError::Config(format!("{key} is too large: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_timeout, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.queue_retention, Duration::from_secs(172_800));
        assert_eq!(config.analysis_delay, Duration::from_millis(500));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn parsed_env_rejects_garbage() {
        env::set_var("CROWDMIND_TEST_PARSE_GARBAGE", "ten");
        let result = parsed_env::<u64>("CROWDMIND_TEST_PARSE_GARBAGE", 1);
        env::remove_var("CROWDMIND_TEST_PARSE_GARBAGE");
        assert!(matches!(result, Err(ModerationError::Config(_))));
    }

    #[test]
    fn scaled_env_rejects_overflow() {
        env::set_var("CROWDMIND_TEST_SCALED_HUGE", u64::MAX.to_string());
        let result = scaled_env("CROWDMIND_TEST_SCALED_HUGE", 1, 3600);
        env::remove_var("CROWDMIND_TEST_SCALED_HUGE");
        assert!(matches!(result, Err(ModerationError::Config(_))));
    }

    #[test]
    fn scaled_env_multiplies_by_unit() {
        let value = scaled_env("CROWDMIND_TEST_SCALED_UNSET", 48, 3600).unwrap();
        assert_eq!(value, Duration::from_secs(172_800));
    }

    #[test]
    fn parsed_env_uses_default_when_unset() {
        let value = parsed_env::<u64>("CROWDMIND_TEST_PARSE_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}
