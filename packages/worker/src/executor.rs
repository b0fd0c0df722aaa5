//! The seam between job processing and whatever actually runs a build.

use std::future::Future;
use std::pin::Pin;

use intake_core::{Condition, JobPayload, StartAttributes};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Future returned by [`Executor::run`]: the build's exit code.
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<i32, ExecError>> + Send + 'a>>;

/// Infrastructure failures reported by an executor.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("connection to build environment failed: {0}")]
    Connection(String),

    #[error("build environment could not be created: {0}")]
    VmCreation(String),

    #[error("execution aborted")]
    Aborted,
}

impl ExecError {
    pub(crate) fn condition(&self) -> Condition {
        match self {
            ExecError::Connection(_) => Condition::ConnectionFailed,
            ExecError::VmCreation(_) => Condition::VmCreationFailed,
            ExecError::Aborted => Condition::CancelRequested,
        }
    }
}

/// Everything an executor gets for one job.
#[derive(Debug)]
pub struct ExecRequest {
    pub payload: JobPayload,
    pub start_attributes: StartAttributes,
    /// Build output, in the order it was produced.
    pub output: mpsc::Sender<String>,
    /// Fired when the job must stop early. Executors should return promptly.
    pub abort: CancellationToken,
}

/// Runs a build for a job.
pub trait Executor: Send + Sync + 'static {
    fn run(&self, request: ExecRequest) -> ExecFuture<'_>;
}
