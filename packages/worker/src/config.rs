use intake_core::OutcomePolicy;
use job_queue::{ConfigError, QueueConfig};

/// Worker settings: where jobs come from and the limits they run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub policy: OutcomePolicy,
}

impl WorkerConfig {
    /// Build a config from environment variables.
    ///
    /// Queue settings are read by [`QueueConfig::from_env`]. Limits:
    /// - `HARD_TIMEOUT_MINUTES` (default: `50`)
    /// - `LOG_TIMEOUT_MINUTES` (default: `10`)
    /// - `MAX_LOG_LENGTH_MIB` (default: `4`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue = QueueConfig::from_lookup(&lookup)?;

        let limit = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key).map(|v| v.trim().to_string()) {
                None => Ok(default),
                Some(v) if v.is_empty() => Ok(default),
                Some(v) => match v.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::InvalidConfig(format!(
                        "{key} must be a positive integer, got {v}"
                    ))),
                },
            }
        };

        let policy = OutcomePolicy::from_limits(
            limit("HARD_TIMEOUT_MINUTES", 50)?,
            limit("LOG_TIMEOUT_MINUTES", 10)?,
            limit("MAX_LOG_LENGTH_MIB", 4)?,
        )
        .ok_or_else(|| ConfigError::InvalidConfig("limits are too large".into()))?;

        Ok(Self { queue, policy })
    }
}
