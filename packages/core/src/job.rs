//! Job entity and its lifecycle state machine.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{JobPayload, RawPayload, StartAttributes};

/// Future type returned by the transport-specific lifecycle operations.
pub type JobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send + 'a>>;

/// Errors raised while decoding or driving a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("malformed start attributes: {0}")]
    StartAttributes(String),

    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Terminal state a finished job is reported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishState {
    Passed,
    Failed,
    Errored,
    Cancelled,
}

impl FinishState {
    /// Finish state for a build that ran to completion with the given exit code.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            FinishState::Passed
        } else {
            FinishState::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinishState::Passed => "passed",
            FinishState::Failed => "failed",
            FinishState::Errored => "errored",
            FinishState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FinishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a job currently is in its lifecycle.
///
/// The markers are monotonic: `Created -> Received -> Started -> Finished`.
/// A job may be requeued from `Received` or `Started`. `Finished` and
/// `Requeued` are terminal for a given job value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Created,
    Received,
    Started,
    Finished { result: FinishState },
    Requeued,
}

impl JobState {
    /// Check if the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished { .. } | JobState::Requeued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Received => "received",
            JobState::Started => "started",
            JobState::Finished { .. } => "finished",
            JobState::Requeued => "requeued",
        }
    }

    /// Validate a transition and return the new state.
    pub fn advance(self, next: JobState) -> Result<JobState, JobError> {
        let allowed = matches!(
            (self, next),
            (JobState::Created, JobState::Received)
                | (JobState::Received, JobState::Started)
                | (JobState::Started, JobState::Finished { .. })
                | (JobState::Received | JobState::Started, JobState::Requeued)
        );

        if allowed {
            Ok(next)
        } else {
            Err(JobError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Finished { result } => write!(f, "finished({})", result),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One build request plus the transport state needed to acknowledge it.
///
/// A job is handed to exactly one consumer. The lifecycle methods move it
/// through the transport's state markers and fail with
/// [`JobError::InvalidTransition`] when called out of order.
pub trait Job: Send + std::fmt::Debug {
    /// Typed build request.
    fn payload(&self) -> &JobPayload;

    /// How the execution environment should be provisioned.
    fn start_attributes(&self) -> &StartAttributes;

    /// The complete original document, for fields not modeled by `payload`.
    fn raw_payload(&self) -> &RawPayload;

    /// Current lifecycle state.
    fn state(&self) -> JobState;

    /// Mark the job as taken by a worker.
    fn received(&mut self) -> JobFuture<'_, ()>;

    /// Mark the job as executing.
    fn started(&mut self) -> JobFuture<'_, ()>;

    /// Mark the job as done. Irrevocable.
    fn finish(&mut self, result: FinishState) -> JobFuture<'_, ()>;

    /// Return the job to its queue for another attempt.
    fn requeue(&mut self) -> JobFuture<'_, ()>;

    /// Append build output to the job's log.
    fn write_log<'a>(&'a mut self, output: &'a str) -> JobFuture<'a, ()>;
}
