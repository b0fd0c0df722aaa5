//! RabbitMQ backend.

use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::delivery::{Acker, Delivery};
use crate::subscribe::{Consumer, run_workers};
use crate::{BrokerError, BrokerFuture, MessageBroker, ProcessorFactory};

/// Broker speaking AMQP 0.9.1.
///
/// Publishing and queue declaration share one channel; every subscribe
/// worker opens its own channel with a prefetch of one.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        tracing::info!("Connecting to message broker");

        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection.create_channel().await?;

        tracing::info!("Connected to message broker");
        Ok(Self {
            connection,
            channel,
        })
    }
}

impl MessageBroker for AmqpBroker {
    fn declare_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        content_type: &'a str,
        body: Vec<u8>,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_content_type(content_type.into()),
                )
                .await?
                .await?;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        concurrency: usize,
        cancel: CancellationToken,
        factory: ProcessorFactory,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            if concurrency == 0 {
                return Err(BrokerError::InvalidConcurrency);
            }

            let mut consumers = Vec::with_capacity(concurrency);
            for _ in 0..concurrency {
                let channel = self.connection.create_channel().await?;
                channel.basic_qos(1, BasicQosOptions::default()).await?;
                let tag = format!("{}-{}", queue, Ulid::new());
                let consumer = channel
                    .basic_consume(
                        queue,
                        &tag,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                consumers.push(AmqpConsumer { channel, consumer });
            }

            run_workers(queue, consumers, cancel, factory).await
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.connection.close(200, "Goodbye").await?;
            Ok(())
        })
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
}

impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        match self.consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(delivery)) => Ok(Some(Delivery::new(
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.data,
                Acker::Amqp(delivery.acker),
            ))),
        }
    }

    async fn shutdown(self) {
        // Unacknowledged prefetched messages go back to the queue.
        if let Err(e) = self.channel.close(200, "consumer stopped").await {
            tracing::warn!(error = %e, "Failed to close consumer channel");
        }
    }
}
