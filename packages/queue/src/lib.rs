//! Job queue transports.
//!
//! A [`JobQueue`] turns a transport into a stream of [`Job`] values. Two
//! transports are provided:
//!
//! - [`FileJobQueue`] - a directory tree polled for job descriptors
//! - [`BrokerJobQueue`] - a message broker queue consumed by a worker pool
//!
//! [`connect_job_queue`] picks one from a [`QueueConfig`].

mod brokered;
mod config;
mod file;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use intake_core::Job;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use brokered::{BrokerJob, BrokerJobQueue};
pub use config::{ConfigError, QueueConfig, QueueKind, ReportingConfig, connect_job_queue};
pub use file::{DEFAULT_POLL_INTERVAL, FileJob, FileJobQueue};

/// Stream of jobs produced by a queue.
///
/// The stream ends when the queue is cancelled or its transport fails. Use
/// [`JobStream::failure`] to tell the two apart.
pub struct JobStream {
    jobs: mpsc::Receiver<Box<dyn Job>>,
    failure: Option<oneshot::Receiver<QueueError>>,
}

impl JobStream {
    /// A stream whose producer never fails.
    pub fn new(jobs: mpsc::Receiver<Box<dyn Job>>) -> Self {
        Self {
            jobs,
            failure: None,
        }
    }

    /// A stream whose producer reports a fatal error on `failure`.
    pub fn with_failure(
        jobs: mpsc::Receiver<Box<dyn Job>>,
        failure: oneshot::Receiver<QueueError>,
    ) -> Self {
        Self {
            jobs,
            failure: Some(failure),
        }
    }

    /// Receive the next job. `None` once the producer has stopped.
    pub async fn recv(&mut self) -> Option<Box<dyn Job>> {
        self.jobs.recv().await
    }

    /// Stop receiving and wait for the producer to finish.
    ///
    /// Jobs still buffered are dropped. Returns the error that stopped the
    /// producer, or `None` if it stopped because it was cancelled.
    pub async fn failure(&mut self) -> Option<QueueError> {
        self.jobs.close();
        while self.jobs.try_recv().is_ok() {}
        self.failure.take()?.await.ok()
    }
}

impl std::fmt::Debug for JobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStream")
            .field("fallible", &self.failure.is_some())
            .finish()
    }
}

/// Future type returned by queue operations.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("base directory {path:?} is not usable: {source}")]
    BaseDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("base directory {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A source of jobs.
pub trait JobQueue: Send + Sync {
    /// Start discovering jobs in the background.
    ///
    /// Jobs are yielded until `cancel` fires. The call returns right away;
    /// it never waits for the first job.
    fn jobs(&self, cancel: CancellationToken) -> Result<JobStream, QueueError>;

    /// Release transport resources. Safe to call even if no job was produced.
    fn cleanup(&self) -> QueueFuture<'_, ()>;
}
