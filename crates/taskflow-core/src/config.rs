//! Engine configuration.

use std::time::Duration;

use crate::workflow::executor::DEFAULT_DELAY_SECONDS;
use crate::workflow::RetryPolicy;

/// Configuration for a Taskflow engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub db_path: String,
    pub retry: RetryPolicy,
    pub webhook_timeout: Duration,
    /// Used by DELAY steps without `delay_seconds`.
    pub default_delay_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "taskflow.db".to_string(),
            retry: RetryPolicy::default(),
            webhook_timeout: Duration::from_secs(30),
            default_delay_seconds: DEFAULT_DELAY_SECONDS,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TASKFLOW_*` environment variables:
    ///
    /// - `TASKFLOW_DB_PATH`
    /// - `TASKFLOW_RETRY_INITIAL_MS`, `TASKFLOW_RETRY_MULTIPLIER`, `TASKFLOW_RETRY_MAX_MS`
    /// - `TASKFLOW_WEBHOOK_TIMEOUT_SECS`
    /// - `TASKFLOW_DEFAULT_DELAY_SECS`
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("TASKFLOW_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = path;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKFLOW_RETRY_INITIAL_MS") {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(m) = parse::<f64>(&lookup, "TASKFLOW_RETRY_MULTIPLIER") {
            config.retry.multiplier = m;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKFLOW_RETRY_MAX_MS") {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "TASKFLOW_WEBHOOK_TIMEOUT_SECS") {
            config.webhook_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "TASKFLOW_DEFAULT_DELAY_SECS") {
            config.default_delay_seconds = secs;
        }
        config
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("[Config] Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
