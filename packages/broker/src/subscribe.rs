//! Worker pool shared by every broker backend.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::delivery::Delivery;
use crate::{BrokerError, MessageProcessor, ProcessorFactory};

/// Source of deliveries for one worker.
pub(crate) trait Consumer: Send + Sized + 'static {
    /// Wait for the next delivery. `None` means the consumer was shut down
    /// by the broker.
    fn next(&mut self) -> impl Future<Output = Result<Option<Delivery>, BrokerError>> + Send;

    /// Release the consumer once the worker stops.
    fn shutdown(self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Run one worker per consumer until `cancel` fires or a worker fails.
///
/// The first worker error cancels the remaining workers and is returned
/// once all of them have stopped.
pub(crate) async fn run_workers<C: Consumer>(
    queue: &str,
    consumers: Vec<C>,
    cancel: CancellationToken,
    factory: ProcessorFactory,
) -> Result<(), BrokerError> {
    if consumers.is_empty() {
        return Err(BrokerError::InvalidConcurrency);
    }

    let stop = cancel.child_token();
    let mut workers = JoinSet::new();
    for (index, consumer) in consumers.into_iter().enumerate() {
        let processor = factory();
        let stop = stop.clone();
        let worker_id = format!("{}-worker-{}", queue, index + 1);
        workers.spawn(async move { consume(worker_id, consumer, processor, stop).await });
    }

    tracing::info!(queue = %queue, workers = workers.len(), "Subscribed");

    let mut result = Ok(());
    while let Some(joined) = workers.join_next().await {
        let outcome = joined
            .map_err(|e| BrokerError::Worker(e.to_string()))
            .and_then(|worker| worker);
        if let Err(e) = outcome {
            tracing::error!(queue = %queue, error = %e, "Consumer worker failed");
            stop.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    tracing::info!(queue = %queue, "Unsubscribed");
    result
}

async fn consume<C: Consumer>(
    worker_id: String,
    mut consumer: C,
    mut processor: Box<dyn MessageProcessor>,
    stop: CancellationToken,
) -> Result<(), BrokerError> {
    tracing::debug!("Starting consumer: {}", worker_id);

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            next = consumer.next() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        processor.process(&delivery).await;

        if !delivery.is_settled()
            && let Err(e) = delivery.ack().await
        {
            break Err(e);
        }
    };

    consumer.shutdown().await;
    tracing::debug!("Stopped consumer: {}", worker_id);
    result
}
