//! Job processing on top of a [`job_queue::JobQueue`].
//!
//! A [`ProcessorPool`] takes jobs from a queue, hands each one to an
//! [`Executor`] and turns whatever happened into an outcome: a finished
//! job with a result, or a requeue.

mod cancel;
mod config;
mod executor;
mod pool;

use intake_core::JobError;
use job_queue::{ConfigError, QueueError};
use thiserror::Error;

pub use cancel::CancelRegistry;
pub use config::WorkerConfig;
pub use executor::{ExecError, ExecFuture, ExecRequest, Executor};
pub use pool::ProcessorPool;

/// Worker errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("job error: {0}")]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
