//! Configuration types.

use std::time::Duration;

use crate::queue::backoff::BackoffPolicy;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct StewardConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Worker polling interval (wake signal short-circuits this).
    pub poll_interval: Duration,
    /// How long a dequeue lock is considered live before another worker may
    /// reclaim the task.
    pub lock_ttl: Duration,
    /// Default attempt budget for enqueued tasks.
    pub default_max_attempts: u32,
    /// Retry backoff policy.
    pub backoff: BackoffPolicy,
    /// Round ceiling for the conversation loop (model calls per turn).
    pub max_rounds: usize,
    /// How long a pending tool confirmation stays answerable.
    pub confirmation_ttl: Duration,
    /// Wall-clock timeout for a single model call.
    pub model_timeout: Duration,
    /// Maximum characters of tool output fed back to the model.
    pub max_tool_output: usize,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/steward.db".to_string(),
            poll_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(300), // 5 minutes
            default_max_attempts: 3,
            backoff: BackoffPolicy::default(),
            max_rounds: 10,
            confirmation_ttl: Duration::from_secs(900), // 15 minutes
            model_timeout: Duration::from_secs(120),
            max_tool_output: 16_000,
        }
    }
}

impl StewardConfig {
    /// Build a configuration from `STEWARD_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("STEWARD_DB_PATH").unwrap_or(defaults.db_path),
            poll_interval: env_secs("STEWARD_POLL_INTERVAL_SECS", defaults.poll_interval),
            lock_ttl: env_secs("STEWARD_LOCK_TTL_SECS", defaults.lock_ttl),
            default_max_attempts: env_parse(
                "STEWARD_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            ),
            backoff: defaults.backoff,
            max_rounds: env_parse("STEWARD_MAX_ROUNDS", defaults.max_rounds),
            confirmation_ttl: env_secs("STEWARD_CONFIRMATION_TTL_SECS", defaults.confirmation_ttl),
            model_timeout: env_secs("STEWARD_MODEL_TIMEOUT_SECS", defaults.model_timeout),
            max_tool_output: env_parse("STEWARD_MAX_TOOL_OUTPUT", defaults.max_tool_output),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
