//! Processor pool: drives jobs from a queue through their lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use intake_core::{Condition, Job, JobPayload, LogMonitor, OutcomePolicy, resolve};
use job_queue::{JobQueue, JobStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelRegistry;
use crate::executor::{ExecRequest, Executor};
use crate::WorkerError;

/// Output chunks buffered between an executor and the job log.
const OUTPUT_BUFFER: usize = 64;

/// A fixed number of processors sharing one job stream.
pub struct ProcessorPool {
    size: usize,
    policy: OutcomePolicy,
    cancellations: CancelRegistry,
}

impl ProcessorPool {
    pub fn new(size: usize, policy: OutcomePolicy) -> Self {
        Self {
            size: size.max(1),
            policy,
            cancellations: CancelRegistry::default(),
        }
    }

    /// Handle for cancelling running jobs from outside the pool.
    pub fn cancellations(&self) -> CancelRegistry {
        self.cancellations.clone()
    }

    /// Process jobs from `queue` until `cancel` fires or the queue fails.
    ///
    /// Cancellation stops taking new jobs; jobs already taken run to their
    /// outcome. The queue is cleaned up once every processor has stopped. A
    /// queue transport failure is returned after cleanup.
    pub async fn run(
        &self,
        queue: &dyn JobQueue,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let jobs = Arc::new(Mutex::new(queue.jobs(cancel.clone())?));

        tracing::info!(size = self.size, "Starting processor pool");

        let mut processors = JoinSet::new();
        for n in 0..self.size {
            let processor = Processor {
                name: format!("processor-{n}"),
                jobs: jobs.clone(),
                executor: executor.clone(),
                policy: self.policy,
                cancellations: self.cancellations.clone(),
                cancel: cancel.clone(),
            };
            processors.spawn(processor.run());
        }

        while let Some(result) = processors.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Processor panicked");
            }
        }

        let failure = jobs.lock().await.failure().await;
        tracing::info!(failed = failure.is_some(), "Processor pool stopped");

        match failure {
            Some(e) => {
                if let Err(cleanup) = queue.cleanup().await {
                    tracing::warn!(error = %cleanup, "Queue cleanup failed");
                }
                Err(e.into())
            }
            None => {
                queue.cleanup().await?;
                Ok(())
            }
        }
    }
}

struct Processor {
    name: String,
    jobs: Arc<Mutex<JobStream>>,
    executor: Arc<dyn Executor>,
    policy: OutcomePolicy,
    cancellations: CancelRegistry,
    cancel: CancellationToken,
}

impl Processor {
    async fn run(self) {
        tracing::debug!(processor = %self.name, "Processor started");

        loop {
            let job = {
                let mut jobs = self.jobs.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    job = jobs.recv() => job,
                }
            };
            let Some(mut job) = job else {
                break;
            };

            let id = job.payload().id;
            if let Err(e) = self.process(job.as_mut()).await {
                tracing::error!(
                    processor = %self.name,
                    id,
                    error = %e,
                    "Job processing failed"
                );
            }
        }

        tracing::debug!(processor = %self.name, "Processor stopped");
    }

    async fn process(&self, job: &mut dyn Job) -> Result<(), WorkerError> {
        let id = job.payload().id;

        job.received().await?;
        if let Err(e) = job.started().await {
            tracing::warn!(
                processor = %self.name,
                id,
                error = %e,
                "Could not start job, requeueing"
            );
            job.requeue().await?;
            return Err(e.into());
        }

        tracing::info!(processor = %self.name, id, "Running job");

        let policy = policy_for(self.policy, job.payload());
        let run = self.cancellations.register(id);
        let condition = self.execute(job, policy, &run.token).await;
        self.cancellations.remove(&run);

        let outcome = policy.classify(condition);
        let disposition = resolve(job, &outcome).await?;

        tracing::info!(
            processor = %self.name,
            id,
            outcome = %outcome,
            disposition = ?disposition,
            "Resolved job"
        );
        Ok(())
    }

    /// Run the executor and watch it. Returns the first condition seen.
    async fn execute(
        &self,
        job: &mut dyn Job,
        policy: OutcomePolicy,
        job_cancel: &CancellationToken,
    ) -> Condition {
        let (output_tx, mut output_rx) = mpsc::channel::<String>(OUTPUT_BUFFER);
        let abort = CancellationToken::new();
        let request = ExecRequest {
            payload: job.payload().clone(),
            start_attributes: job.start_attributes().clone(),
            output: output_tx,
            abort: abort.clone(),
        };

        let mut monitor = LogMonitor::new(policy, now());
        let mut run = self.executor.run(request);

        let interrupted = loop {
            let wait = monitor.next_deadline(now());
            tokio::select! {
                result = &mut run => {
                    // Output produced before the exit still belongs in the log.
                    while let Ok(chunk) = output_rx.try_recv() {
                        if let Some(condition) = write_output(job, &mut monitor, &chunk).await {
                            return condition;
                        }
                    }
                    return match result {
                        Ok(exit_code) => Condition::Exited { exit_code },
                        Err(e) => {
                            tracing::warn!(id = job.payload().id, error = %e, "Executor failed");
                            e.condition()
                        }
                    };
                }
                Some(chunk) = output_rx.recv() => {
                    if let Some(condition) = write_output(job, &mut monitor, &chunk).await {
                        break condition;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if let Some(condition) = monitor.check(now()) {
                        break condition;
                    }
                }
                _ = job_cancel.cancelled() => break Condition::CancelRequested,
            }
        };

        tracing::info!(id = job.payload().id, condition = ?interrupted, "Stopping job");
        abort.cancel();
        drop(output_rx);
        if let Err(e) = run.await {
            tracing::debug!(id = job.payload().id, error = %e, "Executor stopped");
        }
        interrupted
    }
}

/// Current time on the runtime clock, so paused test time applies.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Record `chunk` and append it to the job log unless it breaks the size limit.
async fn write_output(
    job: &mut dyn Job,
    monitor: &mut LogMonitor,
    chunk: &str,
) -> Option<Condition> {
    if let Some(condition) = monitor.record(chunk.len(), now()) {
        return Some(condition);
    }
    if let Err(e) = job.write_log(chunk).await {
        tracing::warn!(id = job.payload().id, error = %e, "Failed to write job log");
    }
    None
}

/// The worker limits, narrowed by any timeouts the job asks for.
///
/// Job timeouts are given in seconds and rounded up to whole minutes, the
/// unit the outcome messages report.
fn policy_for(policy: OutcomePolicy, payload: &JobPayload) -> OutcomePolicy {
    let mut policy = policy;
    if let Some(timeouts) = &payload.timeouts {
        if let Some(secs) = timeouts.hard_limit.filter(|s| *s > 0) {
            policy.hard_timeout = policy.hard_timeout.min(whole_minutes(secs));
        }
        if let Some(secs) = timeouts.log_silence.filter(|s| *s > 0) {
            policy.log_timeout = policy.log_timeout.min(whole_minutes(secs));
        }
    }
    policy
}

fn whole_minutes(secs: u64) -> Duration {
    Duration::from_secs(secs.div_ceil(60).saturating_mul(60))
}
