//! Queue configuration and transport selection.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::{BrokerJobQueue, DEFAULT_POLL_INTERVAL, FileJobQueue, JobQueue, QueueError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid queue config: {0}")]
    InvalidConfig(String),
}

/// Which transport the queue uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueKind {
    /// Poll a directory tree.
    File {
        base_dir: PathBuf,
        poll_interval: Duration,
    },
    /// Consume from a message broker, e.g. `amqp://` or `memory://`.
    Broker { uri: String },
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::File { .. } => "file",
            QueueKind::Broker { .. } => "broker",
        }
    }
}

/// Where broker jobs report their state and log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportingConfig {
    pub state_update_queue: String,
    pub log_queue: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            state_update_queue: "reporting.jobs.builds".to_string(),
            log_queue: "reporting.jobs.logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub kind: QueueKind,
    /// Queue name, e.g. one per build environment class.
    pub name: String,
    /// Number of concurrent consumers.
    pub pool_size: usize,
    pub reporting: ReportingConfig,
}

impl QueueConfig {
    pub fn file(base_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            kind: QueueKind::File {
                base_dir: base_dir.into(),
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            name: name.into(),
            pool_size: 1,
            reporting: ReportingConfig::default(),
        }
    }

    pub fn broker(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: QueueKind::Broker { uri: uri.into() },
            name: name.into(),
            pool_size: 1,
            reporting: ReportingConfig::default(),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `QUEUE_TYPE`: `file` (default), `amqp` or `memory`
    /// - `QUEUE_NAME` (default: `builds.linux`)
    /// - `QUEUE_BASE_DIR` (file, default: `./data/queue`)
    /// - `QUEUE_POLL_INTERVAL_MS` (file, default: `1000`)
    /// - `AMQP_URI` (amqp, required)
    /// - `POOL_SIZE` (default: `1`)
    /// - `STATE_UPDATE_QUEUE` (default: `reporting.jobs.builds`)
    /// - `LOG_QUEUE` (default: `reporting.jobs.logs`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).and_then(non_empty);

        let name = var("QUEUE_NAME").unwrap_or_else(|| "builds.linux".to_string());

        let kind = match var("QUEUE_TYPE").as_deref() {
            None | Some("file") => {
                let base_dir = var("QUEUE_BASE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/queue"));
                let poll_interval =
                    parse_number::<u64>("QUEUE_POLL_INTERVAL_MS", var("QUEUE_POLL_INTERVAL_MS"))?
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_POLL_INTERVAL);
                QueueKind::File {
                    base_dir,
                    poll_interval,
                }
            }
            Some("amqp") => {
                let uri = var("AMQP_URI").ok_or_else(|| {
                    ConfigError::InvalidConfig("AMQP_URI is required for amqp queue".into())
                })?;
                QueueKind::Broker { uri }
            }
            Some("memory") => QueueKind::Broker {
                uri: "memory://".to_string(),
            },
            Some(other) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "unsupported QUEUE_TYPE={other} (expected file, amqp or memory)"
                )));
            }
        };

        let pool_size = parse_number::<usize>("POOL_SIZE", var("POOL_SIZE"))?.unwrap_or(1);
        if pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "POOL_SIZE must be at least 1".into(),
            ));
        }

        let defaults = ReportingConfig::default();
        let reporting = ReportingConfig {
            state_update_queue: var("STATE_UPDATE_QUEUE").unwrap_or(defaults.state_update_queue),
            log_queue: var("LOG_QUEUE").unwrap_or(defaults.log_queue),
        };

        Ok(Self {
            kind,
            name,
            pool_size,
            reporting,
        })
    }
}

/// Open the job queue described by `config`.
pub async fn connect_job_queue(config: &QueueConfig) -> Result<Box<dyn JobQueue>, QueueError> {
    tracing::info!(kind = config.kind.as_str(), queue = %config.name, "Connecting job queue");

    match &config.kind {
        QueueKind::File {
            base_dir,
            poll_interval,
        } => {
            let queue =
                FileJobQueue::new(base_dir, &config.name)?.with_poll_interval(*poll_interval);
            Ok(Box::new(queue))
        }
        QueueKind::Broker { uri } => {
            let broker = broker::connect(uri).await?;
            let queue = BrokerJobQueue::new(
                broker,
                &config.name,
                config.pool_size,
                config.reporting.clone(),
            )
            .await?;
            Ok(Box::new(queue))
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                ConfigError::InvalidConfig(format!("invalid number for {key}={v}"))
            })
        })
        .transpose()
}
