//! Message broker backed job queue.

use std::sync::Arc;

use broker::{Delivery, MessageBroker, MessageProcessor, ProcessFuture, processor_factory};
use chrono::Utc;
use intake_core::{
    FinishState, Job, JobDescriptor, JobError, JobFuture, JobPayload, JobState, RawPayload,
    StartAttributes,
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ReportingConfig;
use crate::{JobQueue, JobStream, QueueError, QueueFuture};

const JSON_CONTENT_TYPE: &str = "application/json";

/// How a broker job was settled by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Finished,
    Requeued,
}

/// Publishes state updates and log parts for broker jobs.
#[derive(Clone)]
struct Reporter {
    broker: Arc<dyn MessageBroker>,
    reporting: ReportingConfig,
}

impl Reporter {
    async fn state_update(&self, update: Value) -> Result<(), JobError> {
        self.publish(&self.reporting.state_update_queue, update).await
    }

    async fn log_part(&self, part: Value) -> Result<(), JobError> {
        self.publish(&self.reporting.log_queue, part).await
    }

    async fn publish(&self, routing_key: &str, body: Value) -> Result<(), JobError> {
        let body = serde_json::to_vec(&body)?;
        self.broker
            .publish("", routing_key, JSON_CONTENT_TYPE, body)
            .await
            .map_err(|e| JobError::Transport(e.to_string()))
    }
}

/// A job consumed from a [`BrokerJobQueue`].
///
/// The delivery stays unacknowledged until the job is finished or
/// requeued. Dropping an unresolved job requeues it.
pub struct BrokerJob {
    descriptor: JobDescriptor,
    delivery_tag: u64,
    state: JobState,
    log_parts: u64,
    reporter: Reporter,
    resolution: Option<oneshot::Sender<Resolution>>,
}

impl BrokerJob {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Publish the last state update. The delivery is settled either way.
    async fn report_final(&self, update: Value) {
        if let Err(e) = self.reporter.state_update(update).await {
            tracing::warn!(
                id = self.descriptor.payload.id,
                error = %e,
                "Failed to report job state"
            );
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        if let Some(tx) = self.resolution.take() {
            let _ = tx.send(resolution);
        }
    }
}

impl std::fmt::Debug for BrokerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerJob")
            .field("id", &self.descriptor.payload.id)
            .field("delivery_tag", &self.delivery_tag)
            .field("state", &self.state)
            .finish()
    }
}

impl Job for BrokerJob {
    fn payload(&self) -> &JobPayload {
        &self.descriptor.payload
    }

    fn start_attributes(&self) -> &StartAttributes {
        &self.descriptor.start_attributes
    }

    fn raw_payload(&self) -> &RawPayload {
        &self.descriptor.raw
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn received(&mut self) -> JobFuture<'_, ()> {
        Box::pin(async move {
            let next = self.state.advance(JobState::Received)?;
            self.reporter
                .state_update(json!({
                    "id": self.descriptor.payload.id,
                    "state": "received",
                    "received_at": Utc::now(),
                }))
                .await?;
            self.state = next;
            Ok(())
        })
    }

    fn started(&mut self) -> JobFuture<'_, ()> {
        Box::pin(async move {
            let next = self.state.advance(JobState::Started)?;
            self.reporter
                .state_update(json!({
                    "id": self.descriptor.payload.id,
                    "state": "started",
                    "started_at": Utc::now(),
                }))
                .await?;
            self.state = next;
            Ok(())
        })
    }

    fn finish(&mut self, result: FinishState) -> JobFuture<'_, ()> {
        Box::pin(async move {
            self.state = self.state.advance(JobState::Finished { result })?;
            self.report_final(json!({
                "id": self.descriptor.payload.id,
                "state": result,
                "finished_at": Utc::now(),
            }))
            .await;
            self.resolve(Resolution::Finished);
            tracing::info!(id = self.descriptor.payload.id, result = %result, "Finished job");
            Ok(())
        })
    }

    fn requeue(&mut self) -> JobFuture<'_, ()> {
        Box::pin(async move {
            self.state = self.state.advance(JobState::Requeued)?;
            self.report_final(json!({
                "id": self.descriptor.payload.id,
                "state": "reset",
            }))
            .await;
            self.resolve(Resolution::Requeued);
            tracing::info!(id = self.descriptor.payload.id, "Requeued job");
            Ok(())
        })
    }

    fn write_log<'a>(&'a mut self, output: &'a str) -> JobFuture<'a, ()> {
        Box::pin(async move {
            self.log_parts += 1;
            self.reporter
                .log_part(json!({
                    "id": self.descriptor.payload.id,
                    "log": output,
                    "number": self.log_parts,
                }))
                .await
        })
    }
}

/// Subscribe worker state: turns deliveries into jobs and holds each
/// delivery until its job is resolved.
struct JobForwarder {
    jobs: mpsc::Sender<Box<dyn Job>>,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl JobForwarder {
    async fn forward(&mut self, delivery: &Delivery) {
        let descriptor = match JobDescriptor::parse(delivery.body()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    delivery_tag = delivery.delivery_tag(),
                    "job payload parse error"
                );
                if let Err(e) = delivery.reject(false).await {
                    tracing::warn!(error = %e, "Failed to reject malformed job");
                }
                return;
            }
        };

        let (resolution_tx, resolution_rx) = oneshot::channel();
        let job = BrokerJob {
            descriptor,
            delivery_tag: delivery.delivery_tag(),
            state: JobState::Created,
            log_parts: 0,
            reporter: self.reporter.clone(),
            resolution: Some(resolution_tx),
        };

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.jobs.send(Box::new(job)) => sent.is_ok(),
        };

        let requeue = if sent {
            // A job dropped without a resolution closes the channel.
            !matches!(resolution_rx.await, Ok(Resolution::Finished))
        } else {
            true
        };

        if requeue && let Err(e) = delivery.reject(true).await {
            tracing::warn!(
                error = %e,
                delivery_tag = delivery.delivery_tag(),
                "Failed to requeue job"
            );
        }
    }
}

impl MessageProcessor for JobForwarder {
    fn process<'a>(&'a mut self, delivery: &'a Delivery) -> ProcessFuture<'a> {
        Box::pin(self.forward(delivery))
    }
}

/// A job queue fed by a message broker queue.
pub struct BrokerJobQueue {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    pool_size: usize,
    reporting: ReportingConfig,
}

impl BrokerJobQueue {
    /// Declare the job queue and the reporting queues.
    pub async fn new(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        pool_size: usize,
        reporting: ReportingConfig,
    ) -> Result<Self, QueueError> {
        let queue = queue.into();

        broker.declare_queue(&queue).await?;
        broker.declare_queue(&reporting.state_update_queue).await?;
        broker.declare_queue(&reporting.log_queue).await?;

        tracing::info!(queue = %queue, pool_size, "Opened broker job queue");

        Ok(Self {
            broker,
            queue,
            pool_size,
            reporting,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl JobQueue for BrokerJobQueue {
    fn jobs(&self, cancel: CancellationToken) -> Result<JobStream, QueueError> {
        let (tx, rx) = mpsc::channel(1);

        let reporter = Reporter {
            broker: self.broker.clone(),
            reporting: self.reporting.clone(),
        };
        let factory = {
            let cancel = cancel.clone();
            processor_factory(move || JobForwarder {
                jobs: tx.clone(),
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            })
        };

        let (failure_tx, failure_rx) = oneshot::channel();
        let broker = self.broker.clone();
        let queue = self.queue.clone();
        let pool_size = self.pool_size;
        tokio::spawn(async move {
            if let Err(e) = broker.subscribe(&queue, pool_size, cancel, factory).await {
                tracing::error!(queue = %queue, error = %e, "Job subscription ended");
                let _ = failure_tx.send(QueueError::Broker(e));
            }
        });

        Ok(JobStream::with_failure(rx, failure_rx))
    }

    fn cleanup(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.broker.close().await?;
            Ok(())
        })
    }
}
