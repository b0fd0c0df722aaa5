//! Core domain types for the job intake layer.
//!
//! This crate contains the transport independent pieces:
//! - Job and JobState for work items and their lifecycle
//! - JobDescriptor for decoding build requests
//! - Outcome and OutcomePolicy for the failure taxonomy
//! - LogMonitor for log size and silence tracking

mod descriptor;
mod job;
mod monitor;
mod outcome;

pub use descriptor::{JobDescriptor, JobPayload, RawPayload, Repository, StartAttributes, Timeouts};
pub use job::{FinishState, Job, JobError, JobFuture, JobState};
pub use monitor::LogMonitor;
pub use outcome::{Condition, Disposition, Outcome, OutcomePolicy, resolve};
