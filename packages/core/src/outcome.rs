//! Outcome and failure policy.
//!
//! Conditions detected while a job runs are classified into a closed set of
//! outcomes. Each outcome carries a fixed user-facing message (only the
//! configured threshold is substituted) and a queue disposition.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{FinishState, Job, JobError};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// What happens to a job once its outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "result", rename_all = "snake_case")]
pub enum Disposition {
    /// Mark the job finished with the given state. Terminal.
    Finish(FinishState),
    /// Put the job back on its queue for another attempt.
    Requeue,
}

/// Something observed about a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The build ran to completion.
    Exited { exit_code: i32 },
    /// No log output for the configured silence limit.
    LogSilence,
    /// Cumulative log size went over the configured limit.
    LogLimitExceeded,
    /// Total run time went over the configured limit.
    WallClockExceeded,
    /// Lost the connection to the VM.
    ConnectionFailed,
    /// The VM could not be provisioned.
    VmCreationFailed,
    /// Somebody asked for the job to be cancelled.
    CancelRequested,
}

/// Classified result of a completed or aborted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    NormalCompletion { exit_code: i32 },
    Cancelled,
    StalledNoOutput { minutes: u64 },
    LogTooLarge { mib: u64 },
    WallClockExceeded { minutes: u64 },
    ConnectionError,
    VmCreationError,
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::NormalCompletion { exit_code } => {
                Disposition::Finish(FinishState::from_exit_code(*exit_code))
            }
            Outcome::Cancelled => Disposition::Finish(FinishState::Cancelled),
            Outcome::StalledNoOutput { .. }
            | Outcome::LogTooLarge { .. }
            | Outcome::WallClockExceeded { .. } => Disposition::Finish(FinishState::Errored),
            Outcome::ConnectionError | Outcome::VmCreationError => Disposition::Requeue,
        }
    }

    /// Text appended to the build log, if this outcome has any.
    pub fn message(&self) -> Option<String> {
        let text = match self {
            Outcome::NormalCompletion { .. } => return None,
            Outcome::StalledNoOutput { minutes } => format!(
                "\n\nNo output has been received in the last {minutes} minutes, this potentially \
                 indicates a stalled build or something wrong with the build itself.\n\n\
                 The build has been terminated.\n\n"
            ),
            Outcome::LogTooLarge { mib } => format!(
                "\n\nThe log length has exceeded the limit of {mib} MiB (this usually means that \
                 the test suite is raising the same exception over and over).\n\n\
                 The build has been terminated.\n\n"
            ),
            Outcome::WallClockExceeded { minutes } => format!(
                "\n\nWe're sorry but your test run exceeded {minutes} minutes.\n\n\
                 One possible solution is to split up your test run.\n\n"
            ),
            Outcome::ConnectionError => "\n\nWe're sorry, but there was an error with the \
                 connection to the VM.\n\nYour job will be requeued shortly.\n\n"
                .to_string(),
            Outcome::VmCreationError => "\n\nWe're sorry, but there was an error starting a new \
                 VM.\n\nYour job will be requeued shortly.\n\n"
                .to_string(),
            Outcome::Cancelled => "\n\nDone: Job Cancelled\n\n".to_string(),
        };
        Some(text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::NormalCompletion { .. } => "normal_completion",
            Outcome::Cancelled => "cancelled",
            Outcome::StalledNoOutput { .. } => "stalled_no_output",
            Outcome::LogTooLarge { .. } => "log_too_large",
            Outcome::WallClockExceeded { .. } => "wall_clock_exceeded",
            Outcome::ConnectionError => "connection_error",
            Outcome::VmCreationError => "vm_creation_error",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds the policy is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomePolicy {
    /// Maximum total run time.
    pub hard_timeout: Duration,
    /// Maximum time without any log output.
    pub log_timeout: Duration,
    /// Maximum cumulative log size in bytes.
    pub max_log_length: u64,
}

impl Default for OutcomePolicy {
    fn default() -> Self {
        Self {
            hard_timeout: Duration::from_secs(50 * 60),
            log_timeout: Duration::from_secs(10 * 60),
            max_log_length: 4 * BYTES_PER_MIB,
        }
    }
}

impl OutcomePolicy {
    /// Build a policy from minute and MiB settings.
    ///
    /// Returns `None` if a setting does not fit in seconds or bytes.
    pub fn from_limits(
        hard_timeout_minutes: u64,
        log_timeout_minutes: u64,
        max_log_mib: u64,
    ) -> Option<Self> {
        Some(Self {
            hard_timeout: Duration::from_secs(hard_timeout_minutes.checked_mul(60)?),
            log_timeout: Duration::from_secs(log_timeout_minutes.checked_mul(60)?),
            max_log_length: max_log_mib.checked_mul(BYTES_PER_MIB)?,
        })
    }

    pub fn classify(&self, condition: Condition) -> Outcome {
        match condition {
            Condition::Exited { exit_code } => Outcome::NormalCompletion { exit_code },
            Condition::LogSilence => Outcome::StalledNoOutput {
                minutes: whole_minutes(self.log_timeout),
            },
            Condition::LogLimitExceeded => Outcome::LogTooLarge {
                mib: self.max_log_length.div_ceil(BYTES_PER_MIB),
            },
            Condition::WallClockExceeded => Outcome::WallClockExceeded {
                minutes: whole_minutes(self.hard_timeout),
            },
            Condition::ConnectionFailed => Outcome::ConnectionError,
            Condition::VmCreationFailed => Outcome::VmCreationError,
            Condition::CancelRequested => Outcome::Cancelled,
        }
    }
}

/// Limits are reported in whole minutes, rounded up.
fn whole_minutes(limit: Duration) -> u64 {
    limit.as_secs().div_ceil(60)
}

/// Apply an outcome to a job: emit its message, then finish or requeue.
///
/// A message that cannot be written is logged; the disposition is applied
/// regardless.
pub async fn resolve(job: &mut dyn Job, outcome: &Outcome) -> Result<Disposition, JobError> {
    if let Some(message) = outcome.message()
        && let Err(e) = job.write_log(&message).await
    {
        tracing::warn!(
            id = job.payload().id,
            outcome = %outcome,
            error = %e,
            "Failed to write outcome message"
        );
    }

    let disposition = outcome.disposition();
    match disposition {
        Disposition::Finish(result) => job.finish(result).await?,
        Disposition::Requeue => job.requeue().await?,
    }

    Ok(disposition)
}
