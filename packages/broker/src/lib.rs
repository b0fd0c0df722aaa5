//! Message broker transport for the job intake layer.
//!
//! This crate wraps a publish/subscribe messaging system behind the
//! [`MessageBroker`] trait.
//!
//! # Backends
//!
//! - `memory://` - in-process broker driven by a Ractor actor
//! - `amqp://`, `amqps://` - RabbitMQ via `lapin` (requires the `amqp` feature)
//!
//! # Usage
//!
//! ```ignore
//! use broker::{connect, processor_factory};
//!
//! let broker = connect("memory://").await?;
//! broker.declare_queue("builds").await?;
//! broker.publish("", "builds", "application/json", body).await?;
//! broker.subscribe("builds", 4, cancel, processor_factory(|| MyProcessor::default())).await?;
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod delivery;
mod memory;
mod subscribe;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use delivery::Delivery;
pub use memory::{MemoryBroker, QueueStats};

/// Future type returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Future type returned by [`MessageProcessor::process`].
pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Builds one processor per subscribe worker.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn MessageProcessor> + Send + Sync>;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("unsupported broker uri: {0}")]
    UnsupportedUri(String),

    #[error("subscribe concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    #[error("consumer worker failed: {0}")]
    Worker(String),

    #[cfg(feature = "amqp")]
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Handles messages for one subscribe worker.
///
/// The worker acknowledges the delivery after `process` returns unless the
/// processor already settled it itself, e.g. with [`Delivery::reject`].
pub trait MessageProcessor: Send + 'static {
    fn process<'a>(&'a mut self, delivery: &'a Delivery) -> ProcessFuture<'a>;
}

/// A publish/subscribe transport.
pub trait MessageBroker: Send + Sync {
    /// Declare a queue. Declaring an existing queue is not an error.
    fn declare_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Publish a message. Failures are returned, not retried.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        content_type: &'a str,
        body: Vec<u8>,
    ) -> BrokerFuture<'a, ()>;

    /// Consume `queue` with `concurrency` workers until `cancel` fires.
    ///
    /// Each worker owns a processor built by `factory` and has at most one
    /// message in flight. Cancellation lets in-flight messages finish.
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        concurrency: usize,
        cancel: CancellationToken,
        factory: ProcessorFactory,
    ) -> BrokerFuture<'a, ()>;

    /// Close the connection.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Wrap a closure as a [`ProcessorFactory`].
pub fn processor_factory<P, F>(build: F) -> ProcessorFactory
where
    P: MessageProcessor,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || Box::new(build()) as Box<dyn MessageProcessor>)
}

/// Connect to the broker named by `uri`.
pub async fn connect(uri: &str) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    let scheme = uri.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("memory") | Some("mem") => Ok(Arc::new(MemoryBroker::start().await?)),
        #[cfg(feature = "amqp")]
        Some("amqp") | Some("amqps") => Ok(Arc::new(AmqpBroker::connect(uri).await?)),
        _ => Err(BrokerError::UnsupportedUri(uri.to_string())),
    }
}
